//! Filter chain
//!
//! Filters are applied in registration order on encode and in reverse order
//! on decode, so `decode(encode(x)) == x` holds for the whole chain as long as
//! it holds for every filter.

use std::fmt;
use std::sync::Arc;

use crate::error::FilterError;

/// A reversible byte transform
pub trait StreamFilter: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, FilterError>;

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, FilterError>;
}

/// Ordered list of filters, cheap to clone and share between threads
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn StreamFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter to the end of the chain
    pub fn push(&mut self, filter: Arc<dyn StreamFilter>) {
        tracing::debug!("Filter '{}' added at position {}", filter.name(), self.filters.len());
        self.filters.push(filter);
    }

    /// Builder-style [`push`](Self::push)
    pub fn with(mut self, filter: impl StreamFilter + 'static) -> Self {
        self.push(Arc::new(filter));
        self
    }

    /// Run every filter's encode in registration order
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, FilterError> {
        let mut current = data.to_vec();
        for filter in &self.filters {
            current = filter.encode(&current)?;
        }
        Ok(current)
    }

    /// Run every filter's decode in reverse registration order
    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>, FilterError> {
        let mut current = data.to_vec();
        for filter in self.filters.iter().rev() {
            current = filter.decode(&current)?;
        }
        Ok(current)
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.filters.iter().map(|filter| filter.name()))
            .finish()
    }
}

/// XORs every byte with a repeating key.
///
/// Not a security measure; useful for checking chain order.
#[derive(Debug, Clone)]
pub struct XorFilter {
    key: Vec<u8>,
}

impl XorFilter {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        let mut key = key.into();
        if key.is_empty() {
            key.push(0);
        }
        Self { key }
    }

    fn apply(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .zip(self.key.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect()
    }
}

impl StreamFilter for XorFilter {
    fn name(&self) -> &str {
        "xor"
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, FilterError> {
        Ok(self.apply(data))
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, FilterError> {
        Ok(self.apply(data))
    }
}
