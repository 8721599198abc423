//! Composite query keys.

use std::collections::BTreeMap;
use std::fmt;

/// Broad resource family, used to pick a cache policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Prices,
    History,
    News,
    Portfolio,
    Other,
}

impl ResourceKind {
    fn from_resource(resource: &str) -> Self {
        match resource {
            "prices" | "commodities" => Self::Prices,
            "history" => Self::History,
            "news" => Self::News,
            "portfolio" => Self::Portfolio,
            _ => Self::Other,
        }
    }
}

/// Cache key over (resource, parameters). Parameters are kept sorted so the
/// rendered id does not depend on insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    resource: String,
    params: BTreeMap<String, String>,
}

impl QueryKey {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Latest prices for every tracked commodity.
    pub fn prices() -> Self {
        Self::new("commodities")
    }

    /// Historical series for one commodity over a range (`1D`, `1W`, ...).
    pub fn history(symbol: &str, range: &str) -> Self {
        Self::new("history")
            .with_param("symbol", symbol)
            .with_param("range", range)
    }

    /// News related to one commodity.
    pub fn news(symbol: &str) -> Self {
        Self::new("news").with_param("symbol", symbol)
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn kind(&self) -> ResourceKind {
        ResourceKind::from_resource(&self.resource)
    }

    /// Rendered composite key, `resource?k1=v1&k2=v2`.
    pub fn id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resource)?;
        for (i, (k, v)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{k}={v}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_order_independent() {
        let a = QueryKey::new("history")
            .with_param("symbol", "GC")
            .with_param("range", "1M");
        let b = QueryKey::new("history")
            .with_param("range", "1M")
            .with_param("symbol", "GC");
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id(), "history?range=1M&symbol=GC");
    }

    #[test]
    fn test_kind() {
        assert_eq!(QueryKey::prices().kind(), ResourceKind::Prices);
        assert_eq!(QueryKey::history("GC", "1D").kind(), ResourceKind::History);
        assert_eq!(QueryKey::news("GC").kind(), ResourceKind::News);
        assert_eq!(QueryKey::new("calendar").kind(), ResourceKind::Other);
        assert_eq!(QueryKey::new("calendar").id(), "calendar");
    }
}
