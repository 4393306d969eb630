use super::parse_date;
use crate::models::{DATE_KEY, TOTAL_KEY};
use std::collections::HashMap;

/// How a record key is treated by the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The reserved date column, or any header that is itself a date.
    Date,
    /// The reserved total column.
    Total,
    /// First sighting; the ticker was just registered at this index.
    NewTicker(usize),
    KnownTicker(usize),
}

/// Ordered, append-only vocabulary of ticker columns for one run.
#[derive(Debug, Clone, Default)]
pub struct TickerRegistry {
    tickers: Vec<String>,
    positions: HashMap<String, usize>,
}

impl TickerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the deploy-time tickers, in order.
    pub fn with_known<I, S>(tickers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut registry = Self::new();
        for t in tickers {
            registry.register(t.into());
        }
        registry
    }

    pub fn classify(&mut self, key: &str) -> Classification {
        if key == DATE_KEY || parse_date(key).is_some() {
            return Classification::Date;
        }
        if key == TOTAL_KEY {
            return Classification::Total;
        }
        match self.positions.get(key) {
            Some(&i) => Classification::KnownTicker(i),
            None => Classification::NewTicker(self.register(key.to_string())),
        }
    }

    fn register(&mut self, ticker: String) -> usize {
        if let Some(&i) = self.positions.get(&ticker) {
            return i;
        }
        let i = self.tickers.len();
        self.positions.insert(ticker.clone(), i);
        self.tickers.push(ticker);
        i
    }

    pub fn position(&self, ticker: &str) -> Option<usize> {
        self.positions.get(ticker).copied()
    }

    pub fn tickers(&self) -> &[String] {
        &self.tickers
    }

    pub fn len(&self) -> usize {
        self.tickers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickers.is_empty()
    }
}
