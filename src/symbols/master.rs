// =============================================================================
// Master Contract Refresh — download, transform, swap
// =============================================================================
//
// The daily rebuild never mutates the live table: rows are downloaded and
// transformed into a complete replacement generation first, and only a fully
// built table is swapped in. A failed download leaves the previous
// generation serving.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::symbols::{
    parse_expiry, BrokerAlias, CanonicalId, ExpiryFormat, Instrument, RegistryTable,
    SymbolRegistry,
};
use crate::types::{Exchange, InstrumentType};

/// One raw row of a broker's master contract file, before normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct MasterRow {
    pub broker: String,
    pub broker_symbol: String,
    pub symbol: String,
    pub exchange: Exchange,
    pub instrument_type: InstrumentType,
    pub lot_size: u32,
    pub tick_size: f64,
    #[serde(default)]
    pub expiry: Option<String>,
    #[serde(default)]
    pub strike: Option<f64>,
}

/// A source of master contract rows. Live brokers download and parse their
/// published files; tests feed rows directly.
#[async_trait]
pub trait ContractSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<MasterRow>, GatewayError>;
}

/// Transform raw master rows into a complete registry generation.
///
/// Rows with unparseable expiries are skipped with a warning rather than
/// poisoning the rebuild; the previous generation keeps serving them.
pub fn transform(rows: Vec<MasterRow>, format: ExpiryFormat) -> RegistryTable {
    let mut instruments = Vec::with_capacity(rows.len());
    let mut aliases = Vec::with_capacity(rows.len());
    let mut skipped = 0usize;

    for row in rows {
        let expiry = match &row.expiry {
            Some(raw) => match parse_expiry(raw, format) {
                Ok(date) => Some(date),
                Err(_) => {
                    skipped += 1;
                    continue;
                }
            },
            None => None,
        };

        let canonical = CanonicalId::new(row.symbol.clone(), row.exchange);
        instruments.push(Instrument {
            symbol: row.symbol,
            exchange: row.exchange,
            instrument_type: row.instrument_type,
            lot_size: row.lot_size,
            tick_size: row.tick_size,
            expiry,
            strike: row.strike,
        });
        aliases.push(BrokerAlias {
            broker: row.broker,
            broker_symbol: row.broker_symbol,
            canonical,
        });
    }

    if skipped > 0 {
        warn!(skipped, "master rows skipped during transform");
    }
    RegistryTable::build(instruments, aliases)
}

/// Fetches a JSON array of [`MasterRow`] from a published master URL.
pub struct HttpContractSource {
    url: String,
    http: reqwest::Client,
}

impl HttpContractSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .expect("failed to build reqwest client"),
        }
    }
}

#[async_trait]
impl ContractSource for HttpContractSource {
    async fn fetch(&self) -> Result<Vec<MasterRow>, GatewayError> {
        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| GatewayError::Internal(format!("master download failed: {e}")))?;
        resp.json()
            .await
            .map_err(|e| GatewayError::Internal(format!("master parse failed: {e}")))
    }
}

/// Run one full refresh cycle: fetch from every source, transform, swap.
///
/// Any source failing aborts the refresh without touching the live table.
pub async fn refresh(
    registry: &SymbolRegistry,
    sources: &[Arc<dyn ContractSource>],
    format: ExpiryFormat,
) -> Result<usize, GatewayError> {
    let mut all_rows = Vec::new();
    for source in sources {
        let mut rows = source.fetch().await?;
        all_rows.append(&mut rows);
    }

    let table = transform(all_rows, format);
    let count = table.len();
    registry.swap(table);
    info!(instruments = count, "master contract refresh complete");
    Ok(count)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource(Vec<MasterRow>);

    #[async_trait]
    impl ContractSource for FixedSource {
        async fn fetch(&self) -> Result<Vec<MasterRow>, GatewayError> {
            Ok(self.0.clone())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl ContractSource for FailingSource {
        async fn fetch(&self) -> Result<Vec<MasterRow>, GatewayError> {
            Err(GatewayError::Internal("download failed".into()))
        }
    }

    fn row(broker: &str, broker_symbol: &str, symbol: &str) -> MasterRow {
        MasterRow {
            broker: broker.into(),
            broker_symbol: broker_symbol.into(),
            symbol: symbol.into(),
            exchange: Exchange::Nse,
            instrument_type: InstrumentType::Equity,
            lot_size: 1,
            tick_size: 0.05,
            expiry: None,
            strike: None,
        }
    }

    #[tokio::test]
    async fn refresh_swaps_a_complete_table() {
        let registry = SymbolRegistry::new();
        let source: Arc<dyn ContractSource> = Arc::new(FixedSource(vec![
            row("flattrade", "RELIANCE-EQ", "RELIANCE"),
            row("flattrade", "SBIN-EQ", "SBIN"),
        ]));

        let count = refresh(&registry, &[source], ExpiryFormat::Live).await.unwrap();
        assert_eq!(count, 2);
        assert!(registry.resolve("SBIN", Exchange::Nse).is_ok());
    }

    #[tokio::test]
    async fn failed_download_leaves_previous_generation() {
        let registry = SymbolRegistry::new();
        let good: Arc<dyn ContractSource> =
            Arc::new(FixedSource(vec![row("flattrade", "RELIANCE-EQ", "RELIANCE")]));
        refresh(&registry, &[good], ExpiryFormat::Live).await.unwrap();

        let bad: Arc<dyn ContractSource> = Arc::new(FailingSource);
        assert!(refresh(&registry, &[bad], ExpiryFormat::Live).await.is_err());

        // The earlier table still serves.
        assert!(registry.resolve("RELIANCE", Exchange::Nse).is_ok());
    }

    #[test]
    fn transform_skips_unparseable_expiries() {
        let mut bad = row("flattrade", "BADFUT", "BADFUT");
        bad.expiry = Some("not-a-date".into());
        let mut good = row("flattrade", "NIFTY26AUGFUT", "NIFTY26AUGFUT");
        good.expiry = Some("2026-08-27".into());

        let table = transform(vec![bad, good], ExpiryFormat::Live);
        assert_eq!(table.len(), 1);
    }
}
