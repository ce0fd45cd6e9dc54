//! Task profiles: named intents that select a model and generation settings.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::DefaultsConfig;
use crate::error::{HaloError, Result};
use crate::types::{ChatRequest, ReasoningEffort};

/// Which configured model a profile points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Nano,
    Flagship,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskProfile {
    pub name: &'static str,
    pub description: &'static str,
    pub model: ModelTier,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub temperature: Option<f32>,
    pub max_completion_tokens: Option<u32>,
}

const fn profile(
    name: &'static str,
    description: &'static str,
    model: ModelTier,
    reasoning_effort: ReasoningEffort,
    temperature: Option<f32>,
) -> TaskProfile {
    TaskProfile {
        name,
        description,
        model,
        reasoning_effort: Some(reasoning_effort),
        temperature,
        max_completion_tokens: None,
    }
}

pub static TASK_PROFILES: &[TaskProfile] = &[
    profile("fast", "Lowest latency answers", ModelTier::Nano, ReasoningEffort::None, None),
    profile("balanced", "General purpose default", ModelTier::Nano, ReasoningEffort::Medium, None),
    profile("cost_effective", "Cheap bulk work", ModelTier::Nano, ReasoningEffort::Low, None),
    profile("reasoning", "Multi-step analysis", ModelTier::Flagship, ReasoningEffort::High, None),
    profile("deep_reasoning", "Hardest problems, slowest", ModelTier::Flagship, ReasoningEffort::Xhigh, None),
    profile("creative", "Open-ended writing", ModelTier::Flagship, ReasoningEffort::Medium, Some(0.9)),
];

pub fn find_profile(name: &str) -> Option<&'static TaskProfile> {
    TASK_PROFILES.iter().find(|p| p.name == name)
}

/// How the model was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    Direct,
    TaskProfile,
    Default,
}

/// The outcome of model resolution for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedModel {
    pub model: String,
    pub deployment: String,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub temperature: Option<f32>,
    pub max_completion_tokens: Option<u32>,
    pub source: ModelSource,
    pub task_profile: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ResolveInput<'a> {
    pub request_model: Option<&'a str>,
    pub task_profile: Option<&'a str>,
    pub default_model: &'a str,
}

#[derive(Debug, Clone)]
pub struct TaskProfileResolver {
    nano_model: String,
    flagship_model: String,
    deployments: HashMap<String, String>,
}

impl TaskProfileResolver {
    pub fn new(defaults: &DefaultsConfig) -> Self {
        Self {
            nano_model: defaults.nano_model.clone(),
            flagship_model: defaults.flagship_model.clone(),
            deployments: defaults.deployments.clone(),
        }
    }

    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Nano => &self.nano_model,
            ModelTier::Flagship => &self.flagship_model,
        }
    }

    fn deployment_for(&self, model: &str) -> String {
        self.deployments
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    /// An explicit model always wins; then a named profile; then the default.
    pub fn resolve(&self, input: ResolveInput<'_>) -> Result<ResolvedModel> {
        if let Some(model) = input.request_model.map(str::trim).filter(|m| !m.is_empty()) {
            return Ok(ResolvedModel {
                model: model.to_string(),
                deployment: self.deployment_for(model),
                reasoning_effort: None,
                temperature: None,
                max_completion_tokens: None,
                source: ModelSource::Direct,
                task_profile: None,
            });
        }

        if let Some(name) = input.task_profile {
            let profile =
                find_profile(name).ok_or_else(|| HaloError::UnknownTaskProfile(name.to_string()))?;
            let model = self.model_for(profile.model).to_string();
            return Ok(ResolvedModel {
                deployment: self.deployment_for(&model),
                model,
                reasoning_effort: profile.reasoning_effort,
                temperature: profile.temperature,
                max_completion_tokens: profile.max_completion_tokens,
                source: ModelSource::TaskProfile,
                task_profile: Some(profile.name.to_string()),
            });
        }

        Ok(ResolvedModel {
            model: input.default_model.to_string(),
            deployment: self.deployment_for(input.default_model),
            reasoning_effort: None,
            temperature: None,
            max_completion_tokens: None,
            source: ModelSource::Default,
            task_profile: None,
        })
    }
}

/// Fill profile-derived settings into the request, only where the caller
/// left the field unset.
pub fn apply_settings(resolved: &ResolvedModel, mut request: ChatRequest) -> ChatRequest {
    if request.reasoning_effort.is_none() {
        request.reasoning_effort = resolved.reasoning_effort;
    }
    if request.temperature.is_none() {
        request.temperature = resolved.temperature;
    }
    if request.max_completion_tokens.is_none() && request.max_tokens.is_none() {
        request.max_completion_tokens = resolved.max_completion_tokens;
    }
    request
}
