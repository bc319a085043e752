// src/strategies/mod.rs
pub mod confluence;
pub mod indicators;
pub mod rsi_reversion;
pub mod traits;

#[cfg(test)]
pub(crate) mod test_support;

use crate::errors::StrategyError;
use confluence::{ConfluenceParams, TrendConfluence};
use rsi_reversion::{ReversionParams, RsiReversion};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use traits::SignalSource;

/// Builds a named strategy from its JSON parameters.
pub type StrategyFactory =
    fn(name: &str, params: &serde_json::Value) -> Result<Arc<dyn SignalSource>, StrategyError>;

/// Maps configuration `kind` strings to strategy constructors.
#[derive(Default)]
pub struct StrategyRegistry {
    factories: BTreeMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(TrendConfluence::KIND, build_confluence);
        registry.register(RsiReversion::KIND, build_reversion);
        registry
    }

    /// Replaces any factory already registered under `kind`.
    pub fn register(&mut self, kind: &str, factory: StrategyFactory) {
        self.factories.insert(kind.to_string(), factory);
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn build(
        &self,
        kind: &str,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<Arc<dyn SignalSource>, StrategyError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| StrategyError::UnknownKind(kind.to_string()))?;
        factory(name, params)
    }
}

/// `null` means "all defaults"; anything else must deserialize cleanly.
fn parse_params<P>(kind: &str, params: &serde_json::Value) -> Result<P, StrategyError>
where
    P: DeserializeOwned + Default,
{
    if params.is_null() {
        return Ok(P::default());
    }
    serde_json::from_value(params.clone()).map_err(|source| StrategyError::MalformedParams {
        kind: kind.to_string(),
        source,
    })
}

fn build_confluence(
    name: &str,
    params: &serde_json::Value,
) -> Result<Arc<dyn SignalSource>, StrategyError> {
    let params: ConfluenceParams = parse_params(TrendConfluence::KIND, params)?;
    Ok(Arc::new(TrendConfluence::named(name, params)?))
}

fn build_reversion(
    name: &str,
    params: &serde_json::Value,
) -> Result<Arc<dyn SignalSource>, StrategyError> {
    let params: ReversionParams = parse_params(RsiReversion::KIND, params)?;
    Ok(Arc::new(RsiReversion::named(name, params)?))
}
