use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pricing::types::PriceCard;

/// Source of price cards for (provider, model, endpoint).
#[async_trait]
pub trait PriceCatalog: Send + Sync {
    async fn load_price_card(&self, provider: &str, model: &str, endpoint: &str) -> Result<Option<Arc<PriceCard>>>;
}

type CardKey = (String, String, String);

fn key(provider: &str, model: &str, endpoint: &str) -> CardKey {
    (provider.to_string(), model.to_string(), endpoint.to_string())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CardFile {
    Many { cards: Vec<PriceCard> },
    List(Vec<PriceCard>),
    One(PriceCard),
}

impl CardFile {
    fn into_cards(self) -> Vec<PriceCard> {
        match self {
            CardFile::Many { cards } | CardFile::List(cards) => cards,
            CardFile::One(card) => vec![card],
        }
    }
}

/// In-memory catalog. A key may hold several cards with different
/// effective windows.
#[derive(Default)]
pub struct StaticPriceCatalog {
    cards: RwLock<HashMap<CardKey, Vec<Arc<PriceCard>>>>,
}

impl StaticPriceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, card: PriceCard) -> Result<()> {
        card.validate()?;
        let k = key(&card.provider, &card.model, &card.endpoint);
        debug!("Registering price card for {}/{}/{}", k.0, k.1, k.2);
        self.cards.write().entry(k).or_default().push(Arc::new(card));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.cards.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the catalog with every card in the `.json` and `.toml` files of
    /// `dir`. A file holds one card, a list of cards, or a `cards` array.
    /// Nothing changes if any file fails to load.
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        if !dir.is_dir() {
            return Err(Error::validation(format!("price card directory {} does not exist", dir.display())));
        }

        let mut loaded = 0;
        let mut fresh: HashMap<CardKey, Vec<Arc<PriceCard>>> = HashMap::new();
        let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.path());

        for entry in entries {
            let path = entry.path();
            let cards = match path.extension().and_then(|e| e.to_str()) {
                Some("json") => serde_json::from_str::<CardFile>(&std::fs::read_to_string(&path)?)?,
                Some("toml") => toml::from_str::<CardFile>(&std::fs::read_to_string(&path)?)?,
                _ => {
                    debug!("Skipping non-card file {}", path.display());
                    continue;
                }
            }
            .into_cards();

            for card in cards {
                card.validate()
                    .map_err(|e| Error::validation(format!("{}: {}", path.display(), e)))?;
                let k = key(&card.provider, &card.model, &card.endpoint);
                fresh.entry(k).or_default().push(Arc::new(card));
                loaded += 1;
            }
        }

        *self.cards.write() = fresh;
        info!("Loaded {} price cards from {}", loaded, dir.display());
        Ok(loaded)
    }

    /// Card effective at `at`; the latest `effective_from` wins.
    pub fn card_at(&self, provider: &str, model: &str, endpoint: &str, at: DateTime<Utc>) -> Option<Arc<PriceCard>> {
        let cards = self.cards.read();
        let found = cards
            .get(&key(provider, model, endpoint))?
            .iter()
            .filter(|c| c.is_effective_at(at))
            .max_by_key(|c| c.effective_from.unwrap_or(DateTime::<Utc>::MIN_UTC))
            .cloned();
        if found.is_none() {
            warn!("Price cards exist for {}/{}/{} but none is effective at {}", provider, model, endpoint, at);
        }
        found
    }
}

#[async_trait]
impl PriceCatalog for StaticPriceCatalog {
    async fn load_price_card(&self, provider: &str, model: &str, endpoint: &str) -> Result<Option<Arc<PriceCard>>> {
        Ok(self.card_at(provider, model, endpoint, Utc::now()))
    }
}
