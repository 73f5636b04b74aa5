//! Plugin slots, configuration documents, and the flattened pipeline definition.
//!
//! A [`ConfigurationDocument`] is what users write (or serve over HTTP); a
//! [`PipelineDefinition`] is what the execution engine consumes. Both are
//! keyed by the seven known [`PluginSlot`]s, each of which may be absent.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque parameter mapping handed to a plugin.
pub type PluginParams = Map<String, Value>;

// ---------------------------------------------------------------------------
// PluginSlot
// ---------------------------------------------------------------------------

/// One of the seven named stages of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PluginSlot {
    DataCollect,
    DataAccess,
    DataProcess,
    DatasetProcess,
    ModelDefine,
    ModelTrain,
    ModelEvaluate,
}

impl PluginSlot {
    /// All slots, in the order a pipeline runs them.
    pub const ALL: [PluginSlot; 7] = [
        PluginSlot::DataCollect,
        PluginSlot::DataAccess,
        PluginSlot::DataProcess,
        PluginSlot::DatasetProcess,
        PluginSlot::ModelDefine,
        PluginSlot::ModelTrain,
        PluginSlot::ModelEvaluate,
    ];

    /// The slot name as it appears in configuration documents.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DataCollect => "dataCollect",
            Self::DataAccess => "dataAccess",
            Self::DataProcess => "dataProcess",
            Self::DatasetProcess => "datasetProcess",
            Self::ModelDefine => "modelDefine",
            Self::ModelTrain => "modelTrain",
            Self::ModelEvaluate => "modelEvaluate",
        }
    }
}

impl fmt::Display for PluginSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Configuration document
// ---------------------------------------------------------------------------

/// A package reference plus the parameters passed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRef {
    /// Package identifier, e.g. `@scope/collector`.
    pub package: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<PluginParams>,
}

impl PluginRef {
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: PluginParams) -> Self {
        self.params = Some(params);
        self
    }
}

/// The plugin table of a configuration document. Every slot is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSlots {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_collect: Option<PluginRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_access: Option<PluginRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_process: Option<PluginRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_process: Option<PluginRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_define: Option<PluginRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_train: Option<PluginRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_evaluate: Option<PluginRef>,
}

impl PluginSlots {
    /// Look up the plugin configured for `slot`.
    pub fn get(&self, slot: PluginSlot) -> Option<&PluginRef> {
        match slot {
            PluginSlot::DataCollect => self.data_collect.as_ref(),
            PluginSlot::DataAccess => self.data_access.as_ref(),
            PluginSlot::DataProcess => self.data_process.as_ref(),
            PluginSlot::DatasetProcess => self.dataset_process.as_ref(),
            PluginSlot::ModelDefine => self.model_define.as_ref(),
            PluginSlot::ModelTrain => self.model_train.as_ref(),
            PluginSlot::ModelEvaluate => self.model_evaluate.as_ref(),
        }
    }

    /// Mutable access to a slot, used by builders and tests.
    pub fn slot_mut(&mut self, slot: PluginSlot) -> &mut Option<PluginRef> {
        match slot {
            PluginSlot::DataCollect => &mut self.data_collect,
            PluginSlot::DataAccess => &mut self.data_access,
            PluginSlot::DataProcess => &mut self.data_process,
            PluginSlot::DatasetProcess => &mut self.dataset_process,
            PluginSlot::ModelDefine => &mut self.model_define,
            PluginSlot::ModelTrain => &mut self.model_train,
            PluginSlot::ModelEvaluate => &mut self.model_evaluate,
        }
    }

    /// Iterate over the populated slots in pipeline order.
    pub fn iter(&self) -> impl Iterator<Item = (PluginSlot, &PluginRef)> {
        PluginSlot::ALL
            .into_iter()
            .filter_map(move |slot| self.get(slot).map(|plugin| (slot, plugin)))
    }
}

/// A pipeline configuration as written by users.
///
/// Wire shape: `{ "name": "...", "plugins": { "<slot>": { "package": "...", "params": {...} } } }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub plugins: PluginSlots,
}

impl ConfigurationDocument {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            plugins: PluginSlots::default(),
        }
    }

    /// Builder-style setter for one plugin slot.
    pub fn with_plugin(mut self, slot: PluginSlot, plugin: PluginRef) -> Self {
        *self.plugins.slot_mut(slot) = Some(plugin);
        self
    }
}

// ---------------------------------------------------------------------------
// Pipeline definition
// ---------------------------------------------------------------------------

/// The flattened pipeline consumed by the execution engine.
///
/// Only constructible from a [`ConfigurationDocument`]; read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDefinition {
    name: Option<String>,
    data_collect: Option<String>,
    data_collect_params: Option<PluginParams>,
    data_access: Option<String>,
    data_access_params: Option<PluginParams>,
    data_process: Option<String>,
    data_process_params: Option<PluginParams>,
    dataset_process: Option<String>,
    dataset_process_params: Option<PluginParams>,
    model_define: Option<String>,
    model_define_params: Option<PluginParams>,
    model_train: Option<String>,
    model_train_params: Option<PluginParams>,
    model_evaluate: Option<String>,
    model_evaluate_params: Option<PluginParams>,
}

impl PipelineDefinition {
    /// Flatten a document. Absent slots stay `None` in both fields.
    pub fn from_document(doc: &ConfigurationDocument) -> Self {
        let package = |slot| doc.plugins.get(slot).map(|p| p.package.clone());
        let params = |slot| doc.plugins.get(slot).and_then(|p| p.params.clone());

        Self {
            name: doc.name.clone(),
            data_collect: package(PluginSlot::DataCollect),
            data_collect_params: params(PluginSlot::DataCollect),
            data_access: package(PluginSlot::DataAccess),
            data_access_params: params(PluginSlot::DataAccess),
            data_process: package(PluginSlot::DataProcess),
            data_process_params: params(PluginSlot::DataProcess),
            dataset_process: package(PluginSlot::DatasetProcess),
            dataset_process_params: params(PluginSlot::DatasetProcess),
            model_define: package(PluginSlot::ModelDefine),
            model_define_params: params(PluginSlot::ModelDefine),
            model_train: package(PluginSlot::ModelTrain),
            model_train_params: params(PluginSlot::ModelTrain),
            model_evaluate: package(PluginSlot::ModelEvaluate),
            model_evaluate_params: params(PluginSlot::ModelEvaluate),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Package reference configured for `slot`.
    pub fn package(&self, slot: PluginSlot) -> Option<&str> {
        match slot {
            PluginSlot::DataCollect => self.data_collect.as_deref(),
            PluginSlot::DataAccess => self.data_access.as_deref(),
            PluginSlot::DataProcess => self.data_process.as_deref(),
            PluginSlot::DatasetProcess => self.dataset_process.as_deref(),
            PluginSlot::ModelDefine => self.model_define.as_deref(),
            PluginSlot::ModelTrain => self.model_train.as_deref(),
            PluginSlot::ModelEvaluate => self.model_evaluate.as_deref(),
        }
    }

    /// Parameters configured for `slot`.
    pub fn params(&self, slot: PluginSlot) -> Option<&PluginParams> {
        match slot {
            PluginSlot::DataCollect => self.data_collect_params.as_ref(),
            PluginSlot::DataAccess => self.data_access_params.as_ref(),
            PluginSlot::DataProcess => self.data_process_params.as_ref(),
            PluginSlot::DatasetProcess => self.dataset_process_params.as_ref(),
            PluginSlot::ModelDefine => self.model_define_params.as_ref(),
            PluginSlot::ModelTrain => self.model_train_params.as_ref(),
            PluginSlot::ModelEvaluate => self.model_evaluate_params.as_ref(),
        }
    }

    /// Defined stages in pipeline order.
    pub fn stages(&self) -> impl Iterator<Item = (PluginSlot, &str, Option<&PluginParams>)> {
        PluginSlot::ALL.into_iter().filter_map(move |slot| {
            self.package(slot)
                .map(|package| (slot, package, self.params(slot)))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
