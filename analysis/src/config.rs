/// Configuration for Memory SSA construction and clobber queries.
#[derive(Debug, Clone)]
pub struct MemorySsaConfig {
    /// The maximum number of candidate clobbers inspected per location when optimizing uses
    check_limit: usize,
    /// Whether to optimize all uses after renaming
    optimize_uses: bool,
    /// Whether to check every clobber query result with an exhaustive re-walk
    verify_clobbers: bool,
}

impl Default for MemorySsaConfig {
    fn default() -> Self {
        Self {
            check_limit: 100,
            optimize_uses: true,
            verify_clobbers: false,
        }
    }
}

impl MemorySsaConfig {
    /// Get a new, default configuration
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub const fn check_limit(&self) -> usize {
        self.check_limit
    }

    #[inline(always)]
    pub const fn should_optimize_uses(&self) -> bool {
        self.optimize_uses
    }

    #[inline(always)]
    pub const fn should_verify_clobbers(&self) -> bool {
        self.verify_clobbers
    }

    /// Set the number of candidate clobbers the use optimizer may inspect for a single location
    /// before giving up on that use.
    ///
    /// Uses which exceed the limit are left unoptimized, and are answered later by the walker on
    /// demand.
    pub fn set_check_limit(&mut self, limit: usize) -> &mut Self {
        self.check_limit = limit;
        self
    }

    /// Set whether uses should be optimized eagerly during construction
    pub fn set_optimize_uses(&mut self, yes: bool) -> &mut Self {
        self.optimize_uses = yes;
        self
    }

    /// Set whether the clobber walker should double-check each of its results.
    ///
    /// This is always enabled in tests, and when the `expensive-checks` feature is enabled.
    pub fn set_verify_clobbers(&mut self, yes: bool) -> &mut Self {
        self.verify_clobbers = yes;
        self
    }
}
