// =============================================================================
// Symbol & Contract Registry — canonical identifiers across brokers
// =============================================================================
//
// Read-mostly: fan-out and order paths resolve symbols on every request, the
// table changes once a day. Rebuilds are atomic — a complete replacement
// table is built off to the side and swapped in one store; readers see the
// old table in full or the new one in full, never a mixture.
// =============================================================================

pub mod master;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::GatewayError;
use crate::types::{Exchange, InstrumentType};

// =============================================================================
// Instrument
// =============================================================================

/// Canonical instrument identity: `(normalized_symbol, exchange)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalId {
    pub symbol: String,
    pub exchange: Exchange,
}

impl CanonicalId {
    pub fn new(symbol: impl Into<String>, exchange: Exchange) -> Self {
        Self { symbol: symbol.into(), exchange }
    }
}

/// One row of the contract master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub exchange: Exchange,
    pub instrument_type: InstrumentType,
    pub lot_size: u32,
    pub tick_size: f64,
    #[serde(default)]
    pub expiry: Option<NaiveDate>,
    #[serde(default)]
    pub strike: Option<f64>,
}

impl Instrument {
    pub fn canonical_id(&self) -> CanonicalId {
        CanonicalId::new(self.symbol.clone(), self.exchange)
    }
}

// =============================================================================
// Registry table
// =============================================================================

/// A complete, immutable registry generation. Built whole, swapped whole.
#[derive(Debug, Default)]
pub struct RegistryTable {
    /// Canonical identity -> instrument attributes.
    instruments: HashMap<CanonicalId, Instrument>,
    /// (broker, exchange, broker_symbol) -> canonical identity.
    broker_to_canonical: HashMap<(String, Exchange, String), CanonicalId>,
    /// (broker, canonical identity) -> broker symbol.
    canonical_to_broker: HashMap<(String, CanonicalId), String>,
}

/// One alias linking a broker's symbol to a canonical instrument.
#[derive(Debug, Clone)]
pub struct BrokerAlias {
    pub broker: String,
    pub broker_symbol: String,
    pub canonical: CanonicalId,
}

impl RegistryTable {
    /// Build a generation from instruments and aliases. Alias insertion is
    /// idempotent per broker: a repeated (broker, exchange, broker_symbol)
    /// overwrites rather than duplicates.
    pub fn build(instruments: Vec<Instrument>, aliases: Vec<BrokerAlias>) -> Self {
        let mut table = Self::default();
        for inst in instruments {
            table.instruments.insert(inst.canonical_id(), inst);
        }
        for alias in aliases {
            table.broker_to_canonical.insert(
                (alias.broker.clone(), alias.canonical.exchange, alias.broker_symbol.clone()),
                alias.canonical.clone(),
            );
            table
                .canonical_to_broker
                .insert((alias.broker, alias.canonical), alias.broker_symbol);
        }
        table
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// The live registry: an `Arc` to the current generation behind one lock.
/// Readers clone the `Arc` and work lock-free against a consistent snapshot.
pub struct SymbolRegistry {
    current: RwLock<Arc<RegistryTable>>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self { current: RwLock::new(Arc::new(RegistryTable::default())) }
    }

    /// Atomically replace the whole table.
    pub fn swap(&self, table: RegistryTable) {
        let rows = table.len();
        *self.current.write() = Arc::new(table);
        info!(rows, "symbol registry swapped");
    }

    /// Snapshot of the current generation.
    pub fn snapshot(&self) -> Arc<RegistryTable> {
        self.current.read().clone()
    }

    /// Resolve a canonical (symbol, exchange) to its instrument attributes.
    pub fn resolve(&self, symbol: &str, exchange: Exchange) -> Result<Instrument, GatewayError> {
        let table = self.snapshot();
        table
            .instruments
            .get(&CanonicalId::new(symbol, exchange))
            .cloned()
            .ok_or_else(|| GatewayError::SymbolNotFound {
                symbol: symbol.to_string(),
                exchange: exchange.to_string(),
            })
    }

    /// Translate a broker-native symbol to the canonical identity.
    pub fn from_broker(
        &self,
        broker: &str,
        exchange: Exchange,
        broker_symbol: &str,
    ) -> Option<CanonicalId> {
        self.snapshot()
            .broker_to_canonical
            .get(&(broker.to_string(), exchange, broker_symbol.to_string()))
            .cloned()
    }

    /// Translate a canonical identity to a broker's native symbol. Falls back
    /// to the canonical symbol when the broker has no alias (most equity
    /// symbols are shared verbatim).
    pub fn to_broker(&self, broker: &str, canonical: &CanonicalId) -> String {
        self.snapshot()
            .canonical_to_broker
            .get(&(broker.to_string(), canonical.clone()))
            .cloned()
            .unwrap_or_else(|| canonical.symbol.clone())
    }
}

impl Default for SymbolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SymbolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolRegistry")
            .field("instruments", &self.snapshot().len())
            .finish()
    }
}

// =============================================================================
// Expiry parsing
// =============================================================================

/// Which expiry-date format to expect. Live master files carry a bare date;
/// the sandbox master carries a full timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryFormat {
    /// `YYYY-MM-DD`
    Live,
    /// `YYYY-MM-DD HH:MM:SS`
    Sandbox,
}

/// Parse an expiry column with the selected format.
pub fn parse_expiry(raw: &str, format: ExpiryFormat) -> Result<NaiveDate, GatewayError> {
    match format {
        ExpiryFormat::Live => NaiveDate::parse_from_str(raw, "%Y-%m-%d"),
        ExpiryFormat::Sandbox => {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|dt| dt.date())
        }
    }
    .map_err(|e| GatewayError::Internal(format!("bad expiry '{raw}': {e}")))
}

// =============================================================================
// Tests
// =============================================================================
