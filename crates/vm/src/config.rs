//! VM configuration.
//!
//! Mirrors `pasc_compiler::config::CompilerConfig`'s builder-style,
//! validate-at-construction shape: plain fields, a fluent `with_*` builder.

/// Configuration for a `Vm` instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Bytes reserved for the data stack (call frames and register spills).
    /// Exceeding this bound traps as `TrapKind::CallStackOverflow`.
    pub stack_bytes: usize,
    /// Maximum nesting depth of the return stack (pending `CALL`s).
    /// Exceeding this bound traps as `TrapKind::CallStackOverflow`.
    pub max_call_depth: usize,
}

impl VmConfig {
    pub fn new() -> Self {
        VmConfig {
            stack_bytes: 1 << 20,
            max_call_depth: 4096,
        }
    }

    pub fn with_stack_bytes(mut self, bytes: usize) -> Self {
        self.stack_bytes = bytes;
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_nonzero_stack_and_depth() {
        let cfg = VmConfig::new();
        assert!(cfg.stack_bytes > 0);
        assert!(cfg.max_call_depth > 0);
    }

    #[test]
    fn builder_methods_chain() {
        let cfg = VmConfig::new().with_stack_bytes(4096).with_max_call_depth(8);
        assert_eq!(cfg.stack_bytes, 4096);
        assert_eq!(cfg.max_call_depth, 8);
    }
}
