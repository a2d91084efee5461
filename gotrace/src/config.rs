//! Options for probe resolution and trace interpretation.

/// Runtime routine invoked when a goroutine needs a bigger stack (closure context variant)
pub const MORESTACK: &str = "runtime.morestack";

/// Runtime routine invoked when a goroutine needs a bigger stack (no context variant)
pub const MORESTACK_NOCTXT: &str = "runtime.morestack_noctxt";

/// Default bound on a single goroutine stack before it is evicted
pub const DEFAULT_MAX_STACK_DEPTH: usize = 65_536;

/// Which symbols to instrument and which runtime routines mark stack growth
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOptions {
    pub package_prefixes: Vec<String>,
    pub growth_routines: Vec<String>,
}

impl ResolveOptions {
    pub fn with_prefixes<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            package_prefixes: prefixes.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            package_prefixes: vec!["main.".to_string()],
            growth_routines: vec![MORESTACK.to_string(), MORESTACK_NOCTXT.to_string()],
        }
    }
}

/// Per-function statistic strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AggregationMode {
    /// Running sums and min/max only
    #[default]
    Flat,
    /// Running sums plus every individual call sample
    Detailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpretOptions {
    pub mode: AggregationMode,
    /// `None` leaves goroutine stacks unbounded
    pub max_stack_depth: Option<usize>,
}

impl Default for InterpretOptions {
    fn default() -> Self {
        Self {
            mode: AggregationMode::Flat,
            max_stack_depth: Some(DEFAULT_MAX_STACK_DEPTH),
        }
    }
}
