use krpc_encoding::NodeId;

/// Recognized configuration options (§6). Defaults are normative.
#[derive(Clone, Debug)]
pub struct DhtConfig {
    pub bind_port: u16,
    pub node_id: Option<NodeId>,
    pub bootstrap_endpoints: Vec<(String, u16)>,
    pub k: usize,
    pub alpha: usize,
    pub lookup_deadline_ms: u64,
    pub query_timeout_ms: u64,
    pub token_rotation_s: u64,
}

impl Default for DhtConfig {
    fn default() -> DhtConfig {
        DhtConfig {
            bind_port: 6881,
            node_id: None,
            bootstrap_endpoints: Vec::new(),
            k: 8,
            alpha: 3,
            lookup_deadline_ms: 5_000,
            query_timeout_ms: 1_500,
            token_rotation_s: 300,
        }
    }
}
