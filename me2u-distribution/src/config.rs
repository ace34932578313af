//! Configuration for distributors and the WebSocket gateway.

use me2u_core::DEFAULT_JSONLD_CONTEXT;

/// Per-document distribution settings.
#[derive(Debug, Clone)]
pub struct DistributionConfig {
    /// Prefix for per-document channel names
    pub channel_prefix: String,
    /// `@context` attached to annotations on one-shot reads
    pub jsonld_context: String,
    /// Registry errors buffered for the owner before new ones are dropped
    pub error_channel_capacity: usize,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            channel_prefix: "annotations-".to_string(),
            jsonld_context: DEFAULT_JSONLD_CONTEXT.to_string(),
            error_channel_capacity: 64,
        }
    }
}

impl DistributionConfig {
    /// Channel a document is served on.
    pub fn channel_for(&self, doc_url: &str) -> String {
        format!("{}{doc_url}", self.channel_prefix)
    }
}

/// WebSocket gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outgoing frames buffered per connection
    pub outgoing_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9191".to_string(),
            outgoing_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distribution_defaults() {
        let config = DistributionConfig::default();
        assert_eq!(config.channel_prefix, "annotations-");
        assert_eq!(config.jsonld_context, "http://www.w3.org/ns/anno.jsonld");
        assert_eq!(config.channel_for("docA"), "annotations-docA");
    }

    #[test]
    fn test_channels_do_not_collide() {
        let config = DistributionConfig::default();
        assert_ne!(config.channel_for("docA"), config.channel_for("docB"));
    }

    #[test]
    fn test_gateway_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9191");
        assert_eq!(config.outgoing_capacity, 256);
    }
}
