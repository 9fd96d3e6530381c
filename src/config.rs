//! Engine configuration knobs.

/// Approval and read-path constraints shared through the store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Commission rate assigned to accounts created on approval.
    /// Must not exceed 100; approval fails validation otherwise.
    pub default_commission_rate_percent: u32,
    /// Hard cap applied to `Page::limit` on every list operation.
    pub max_page_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_commission_rate_percent: 10,
            max_page_size: 200,
        }
    }
}
