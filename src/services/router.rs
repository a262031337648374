//! Model router
//!
//! Maps a claimed Claude model name onto a tier, then resolves the tier's
//! current selection to a `(provider, concrete model)` pair. Selections are
//! readable concurrently and swappable at runtime through the config API.

use crate::config::{ProviderConfig, Settings};
use crate::storage::HistoryStore;
use crate::utils::error::{AppError, AppResult};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Model tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Big,
    Middle,
    Small,
}

impl Tier {
    /// Tier for a claimed model name: haiku maps small, sonnet middle,
    /// opus big; anything else defaults to big
    pub fn of_model(model: &str) -> Tier {
        let lower = model.to_lowercase();
        if lower.contains("haiku") {
            Tier::Small
        } else if lower.contains("sonnet") {
            Tier::Middle
        } else if lower.contains("opus") {
            Tier::Big
        } else {
            Tier::Big
        }
    }

    /// Key used in the persisted config table and the config API
    pub fn config_key(&self) -> &'static str {
        match self {
            Tier::Big => "BIG_MODEL",
            Tier::Middle => "MIDDLE_MODEL",
            Tier::Small => "SMALL_MODEL",
        }
    }

    pub const ALL: [Tier; 3] = [Tier::Big, Tier::Middle, Tier::Small];
}

/// Resolution outcome for one request
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    /// Snapshot of the serving provider's configuration
    pub provider: ProviderConfig,
    /// Concrete upstream model name
    pub concrete_model: String,
    pub tier: Tier,
}

/// Current selection per tier; each value is `Provider:model` or a bare
/// concrete model
#[derive(Debug, Clone, Default)]
pub struct TierSelections {
    pub big: String,
    pub middle: String,
    pub small: String,
}

impl TierSelections {
    fn get(&self, tier: Tier) -> &str {
        match tier {
            Tier::Big => &self.big,
            Tier::Middle => &self.middle,
            Tier::Small => &self.small,
        }
    }

    fn set(&mut self, tier: Tier, value: String) {
        match tier {
            Tier::Big => self.big = value,
            Tier::Middle => self.middle = value,
            Tier::Small => self.small = value,
        }
    }
}

/// The router
pub struct ModelRouter {
    providers: Vec<ProviderConfig>,
    selections: RwLock<TierSelections>,
}

impl ModelRouter {
    /// Build from settings; tiers without a configured selection fall back
    /// to the first provider advertising that tier
    pub fn new(settings: &Settings) -> Self {
        let mut selections = TierSelections::default();

        for tier in Tier::ALL {
            let configured = match tier {
                Tier::Big => settings.server.big_model.clone(),
                Tier::Middle => settings.server.middle_model.clone(),
                Tier::Small => settings.server.small_model.clone(),
            };

            let value = configured.or_else(|| {
                settings.providers.iter().find_map(|p| {
                    p.models_for_tier(tier)
                        .first()
                        .map(|m| format!("{}:{}", p.name, m))
                })
            });

            match value {
                Some(v) => selections.set(tier, v),
                None => warn!("No provider advertises the {} tier", tier.config_key()),
            }
        }

        info!(
            "Router selections: BIG={} MIDDLE={} SMALL={}",
            selections.big, selections.middle, selections.small
        );

        Self {
            providers: settings.providers.clone(),
            selections: RwLock::new(selections),
        }
    }

    /// Apply selections persisted in the history store's config table,
    /// skipping any that no longer validate against the catalog
    pub async fn restore_persisted(&self, store: &HistoryStore) -> AppResult<()> {
        let persisted = store.load_selections().await?;

        for tier in Tier::ALL {
            if let Some(value) = persisted.get(tier.config_key()) {
                match self.parse_selection(tier, value) {
                    Ok(_) => {
                        self.selections.write().await.set(tier, value.clone());
                        info!("Restored {} = {}", tier.config_key(), value);
                    }
                    Err(e) => {
                        warn!(
                            "Ignoring persisted {} = {}: {}",
                            tier.config_key(),
                            value,
                            e
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve a claimed model to the provider and concrete model serving it
    pub async fn resolve(&self, claimed_model: &str) -> AppResult<ResolvedModel> {
        let tier = Tier::of_model(claimed_model);
        let selection = {
            let guard = self.selections.read().await;
            guard.get(tier).to_string()
        };

        if selection.is_empty() {
            return Err(AppError::NoProvider(format!(
                "no provider advertises the {} tier",
                tier.config_key()
            )));
        }

        let (provider, concrete_model) = self.parse_selection(tier, &selection)?;
        debug!(
            "Routed {} -> {}:{} ({})",
            claimed_model,
            provider.name,
            concrete_model,
            tier.config_key()
        );

        Ok(ResolvedModel {
            provider: provider.clone(),
            concrete_model,
            tier,
        })
    }

    /// Parse and validate a selection string against the catalog
    fn parse_selection<'a>(
        &'a self,
        tier: Tier,
        selection: &str,
    ) -> AppResult<(&'a ProviderConfig, String)> {
        if let Some((provider_name, model)) = selection.split_once(':') {
            let provider = self
                .providers
                .iter()
                .find(|p| p.name.eq_ignore_ascii_case(provider_name))
                .ok_or_else(|| {
                    AppError::UnknownModel(format!(
                        "selection '{}' references unknown provider '{}'",
                        selection, provider_name
                    ))
                })?;

            if !provider
                .models_for_tier(tier)
                .iter()
                .any(|m| m.as_str() == model)
            {
                return Err(AppError::UnknownModel(format!(
                    "provider '{}' does not list '{}' for {}",
                    provider.name,
                    model,
                    tier.config_key()
                )));
            }
            return Ok((provider, model.to_string()));
        }

        // Bare model: first provider advertising it for this tier wins
        self.providers
            .iter()
            .find(|p| p.models_for_tier(tier).iter().any(|m| m.as_str() == selection))
            .map(|p| (p, selection.to_string()))
            .ok_or_else(|| {
                AppError::UnknownModel(format!(
                    "no provider lists '{}' for {}",
                    selection,
                    tier.config_key()
                ))
            })
    }

    /// Validate and apply a new selection for one tier, persisting it
    pub async fn update_selection(
        &self,
        tier: Tier,
        value: &str,
        store: &HistoryStore,
    ) -> AppResult<()> {
        self.parse_selection(tier, value)?;

        {
            let mut guard = self.selections.write().await;
            guard.set(tier, value.to_string());
        }
        store.save_selection(tier.config_key(), value).await?;
        info!("Updated {} = {}", tier.config_key(), value);
        Ok(())
    }

    /// Snapshot of the current selections
    pub async fn current(&self) -> TierSelections {
        self.selections.read().await.clone()
    }

    /// All `Provider:model` choices advertised for a tier
    pub fn available(&self, tier: Tier) -> Vec<String> {
        self.providers
            .iter()
            .flat_map(|p| {
                p.models_for_tier(tier)
                    .iter()
                    .map(move |m| format!("{}:{}", p.name, m))
            })
            .collect()
    }
}
