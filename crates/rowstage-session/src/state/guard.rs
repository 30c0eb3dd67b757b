use rowstage_core::WorkContext;

/// Identity of the context at the moment a request was issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextToken {
    generation: u64,
    context: WorkContext,
}

impl ContextToken {
    pub fn context(&self) -> &WorkContext {
        &self.context
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Fences late results. Every context switch bumps the generation, so a
/// result issued under an older generation never lands, even if the user
/// has since switched back to the same triple.
#[derive(Debug, Clone)]
pub struct ContextGuard {
    generation: u64,
    context: WorkContext,
}

impl ContextGuard {
    pub fn new(context: WorkContext) -> Self {
        Self {
            generation: 0,
            context,
        }
    }

    pub fn context(&self) -> &WorkContext {
        &self.context
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Capture the current identity for a request about to be issued.
    pub fn token(&self) -> ContextToken {
        ContextToken {
            generation: self.generation,
            context: self.context.clone(),
        }
    }

    /// Move to a new context, invalidating every outstanding token.
    pub fn switch(&mut self, context: WorkContext) {
        self.generation += 1;
        self.context = context;
    }

    pub fn is_current(&self, token: &ContextToken) -> bool {
        token.generation == self.generation && token.context == self.context
    }

    /// Pass `value` through if `token` is still current; otherwise drop it.
    pub fn admit<T>(&self, token: &ContextToken, what: &str, value: T) -> Option<T> {
        if self.is_current(token) {
            Some(value)
        } else {
            tracing::debug!(
                "dropping stale {what} for {} (generation {}, now {} at {})",
                token.context,
                token.generation,
                self.context,
                self.generation
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(branch: &str) -> WorkContext {
        WorkContext::new("local", "shop", branch)
    }

    #[test]
    fn token_is_current_until_switch() {
        let mut guard = ContextGuard::new(ctx("wi/a/01"));
        let token = guard.token();
        assert!(guard.is_current(&token));
        guard.switch(ctx("wi/b/01"));
        assert!(!guard.is_current(&token));
        assert_eq!(guard.admit(&token, "head", "h1"), None);
    }

    #[test]
    fn switching_back_does_not_revive_old_tokens() {
        let mut guard = ContextGuard::new(ctx("wi/a/01"));
        let token = guard.token();
        guard.switch(ctx("wi/b/01"));
        guard.switch(ctx("wi/a/01"));
        assert_eq!(guard.context(), token.context());
        assert!(!guard.is_current(&token));
    }

    #[test]
    fn admit_passes_current_results() {
        let guard = ContextGuard::new(ctx("wi/a/01"));
        let token = guard.token();
        assert_eq!(guard.admit(&token, "tables", vec!["items"]), Some(vec!["items"]));
    }
}
