//! Compiler configuration.
//!
//! The numeric windows here (branch radius, literal radius, flush margins)
//! are target tuning constants, not semantics: the encoding module reports
//! the hard architectural limits, and these values only decide how early the
//! assembler gets nervous about approaching them.

use serde::{Deserialize, Serialize};

/// Tuning knobs for a single compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JitConfig {
    /// Hard limit on generated code size in bytes. Exceeding it aborts the
    /// compilation and the method stays interpreted.
    pub code_limit_bytes: usize,
    /// Distance (bytes) a pending literal may drift from its first use
    /// before the pool is force-flushed.
    pub literal_window_bytes: usize,
    /// Distance (bytes) an unbound conditional branch may span before it is
    /// routed through a trampoline.
    pub branch_window_bytes: usize,
    /// Code size (bytes) past which branches to still-unbound labels are
    /// pessimistically given trampolines up front.
    pub long_branch_threshold: usize,
    /// Ticks granted per `Compiler::step` call when the caller does not pass
    /// an explicit budget. One bytecode costs one tick.
    pub default_budget_ticks: u32,
    /// Merge identical unhandled exception kinds into one stub per method.
    pub share_exception_stubs: bool,
    /// Record on-stack-replacement entries at loop headers.
    pub enable_osr: bool,
    /// Allow one level of loop peeling on the first revisit of a backward
    /// branch target.
    pub loop_peeling: bool,
    /// Predict backward conditional branches as taken when laying out code.
    pub predict_backward_taken: bool,
    /// Keep a comment side table for disassembly output.
    pub emit_comments: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            code_limit_bytes: 64 * 1024,
            literal_window_bytes: 3 * 1024,
            branch_window_bytes: 256 * 1024,
            long_branch_threshold: 192 * 1024,
            default_budget_ticks: 128,
            share_exception_stubs: true,
            enable_osr: true,
            loop_peeling: true,
            predict_backward_taken: true,
            emit_comments: true,
        }
    }
}

impl JitConfig {
    /// Parse a config from TOML text. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = JitConfig::default();
        assert!(cfg.share_exception_stubs);
        assert!(cfg.loop_peeling);
        assert!(cfg.code_limit_bytes > 0);
    }

    #[test]
    fn test_toml_overrides() {
        let cfg = JitConfig::from_toml_str(
            "code_limit_bytes = 4096\nshare_exception_stubs = false\n",
        )
        .unwrap();
        assert_eq!(cfg.code_limit_bytes, 4096);
        assert!(!cfg.share_exception_stubs);
        // untouched keys keep defaults
        assert!(cfg.loop_peeling);
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        assert!(JitConfig::from_toml_str("no_such_knob = 1\n").is_err());
    }
}
