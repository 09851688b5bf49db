//! Compiler configuration.
//!
//! Mirrors the builder-style, validate-at-construction `CompilerConfig`
//! pattern this workspace uses elsewhere: plain fields, a fluent `with_*`
//! builder, and validation performed as soon as enough information exists
//! rather than deferred to first use.

/// Which register/stack split a `Compiler` lowers calls to. Only `Default`
/// is implemented; the enum exists so a host can select an alternate
/// convention in the future without changing `Compiler`'s public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallingConvention {
    /// First four integer/pointer args in GPRs, first four float args in
    /// FPRs, the rest on the caller's stack; a hidden pointer argument for
    /// record returns.
    #[default]
    Default,
}

/// Whether the compiler is consuming a whole `program ... .` unit or a
/// single REPL input line appended to an already-open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompilerMode {
    #[default]
    Program,
    Repl,
}

/// Configuration for a `Compiler` instance.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    pub mode: CompilerMode,
    pub calling_convention: CallingConvention,
    /// Maximum number of diagnostics collected before compilation gives up
    /// outright (protects against pathological inputs that resynchronize
    /// on every token). `0` means unlimited.
    pub max_diagnostics: usize,
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig {
            mode: CompilerMode::Program,
            calling_convention: CallingConvention::Default,
            max_diagnostics: 200,
        }
    }

    pub fn with_mode(mut self, mode: CompilerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_calling_convention(mut self, cc: CallingConvention) -> Self {
        self.calling_convention = cc;
        self
    }

    /// Set the diagnostic cap. Validated immediately: `0` is the sentinel
    /// for "unlimited", any other value is accepted as-is.
    pub fn with_max_diagnostics(mut self, max: usize) -> Self {
        self.max_diagnostics = max;
        self
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_program_mode_and_default_convention() {
        let cfg = CompilerConfig::new();
        assert_eq!(cfg.mode, CompilerMode::Program);
        assert_eq!(cfg.calling_convention, CallingConvention::Default);
    }

    #[test]
    fn builder_methods_chain() {
        let cfg = CompilerConfig::new()
            .with_mode(CompilerMode::Repl)
            .with_max_diagnostics(10);
        assert_eq!(cfg.mode, CompilerMode::Repl);
        assert_eq!(cfg.max_diagnostics, 10);
    }
}
