use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::InvocationError;
use crate::model::{Instance, InvocationContext, TestBody};
use crate::params::ParameterSource;
use crate::runner::retry::RetryPolicyFactory;

/// How a unit asks to be scheduled relative to the run's parallel mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParallelHint {
    /// No explicit request; follow the run configuration.
    #[default]
    Inherit,
    Parallel,
    Sequential,
}

/// A named executable test definition.
///
/// Built with the chained setters below, then handed to the engine. Units are
/// not modified once the run starts.
#[derive(Clone)]
pub struct Unit {
    pub name: String,
    /// Owning class, used for class-level isolation and class hooks.
    pub class: String,
    pub groups: BTreeSet<String>,
    /// Units that must complete first, by name.
    pub depends_on: Vec<String>,
    /// Groups whose members must complete first.
    pub depends_on_groups: Vec<String>,
    /// Lower runs first among otherwise unordered units.
    pub priority: i32,
    pub source: Option<ParameterSource>,
    /// Unit-level retry policy.
    pub retry: Option<Arc<dyn RetryPolicyFactory>>,
    /// Parameter-tuple-specific retry policy; consulted before `retry`.
    pub param_retry: Option<Arc<dyn RetryPolicyFactory>>,
    pub timeout: Option<Duration>,
    /// Run even if dependencies failed or were skipped.
    pub always_run: bool,
    pub instance: Option<Instance>,
    pub parallel: ParallelHint,
    pub(crate) body: Arc<dyn TestBody>,
}

impl Unit {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&InvocationContext<'_>) -> Result<(), InvocationError> + Send + Sync + 'static,
    {
        Self::with_body(name, Arc::new(body))
    }

    pub fn with_body(name: impl Into<String>, body: Arc<dyn TestBody>) -> Self {
        Self {
            name: name.into(),
            class: String::new(),
            groups: BTreeSet::new(),
            depends_on: Vec::new(),
            depends_on_groups: Vec::new(),
            priority: 0,
            source: None,
            retry: None,
            param_retry: None,
            timeout: None,
            always_run: false,
            instance: None,
            parallel: ParallelHint::Inherit,
            body,
        }
    }

    pub fn in_class(mut self, class: impl Into<String>) -> Self {
        self.class = class.into();
        self
    }

    pub fn in_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }

    pub fn depends_on<I, S>(mut self, units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(units.into_iter().map(Into::into));
        self
    }

    pub fn depends_on_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on_groups
            .extend(groups.into_iter().map(Into::into));
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_source(mut self, source: ParameterSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_retry(mut self, policy: impl RetryPolicyFactory + 'static) -> Self {
        self.retry = Some(Arc::new(policy));
        self
    }

    pub fn with_param_retry(mut self, policy: impl RetryPolicyFactory + 'static) -> Self {
        self.param_retry = Some(Arc::new(policy));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }

    /// Bind the unit (and any instance-bound source) to `instance`.
    /// The class defaults to the instance's class when unset.
    pub fn on_instance(mut self, instance: Instance) -> Self {
        if self.class.is_empty() {
            self.class = instance.class().to_owned();
        }
        self.instance = Some(instance);
        self
    }

    pub fn parallel(mut self, hint: ParallelHint) -> Self {
        self.parallel = hint;
        self
    }

    pub(crate) fn body(&self) -> &dyn TestBody {
        self.body.as_ref()
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("name", &self.name)
            .field("class", &self.class)
            .field("groups", &self.groups)
            .field("depends_on", &self.depends_on)
            .field("depends_on_groups", &self.depends_on_groups)
            .field("priority", &self.priority)
            .field("source", &self.source.as_ref().map(ParameterSource::name))
            .field("always_run", &self.always_run)
            .field("parallel", &self.parallel)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &InvocationContext<'_>) -> Result<(), InvocationError> {
        Ok(())
    }

    #[test]
    fn builder_sets_fields() {
        let unit = Unit::new("login", noop)
            .in_class("AuthTests")
            .in_groups(["smoke", "auth"])
            .depends_on(["register"])
            .depends_on_groups(["db"])
            .priority(-1)
            .timeout(Duration::from_secs(2))
            .always_run();
        assert_eq!(unit.name, "login");
        assert_eq!(unit.class, "AuthTests");
        assert!(unit.groups.contains("smoke"));
        assert_eq!(unit.depends_on, vec!["register"]);
        assert_eq!(unit.depends_on_groups, vec!["db"]);
        assert_eq!(unit.priority, -1);
        assert_eq!(unit.timeout, Some(Duration::from_secs(2)));
        assert!(unit.always_run);
        assert_eq!(unit.parallel, ParallelHint::Inherit);
    }

    #[test]
    fn instance_supplies_default_class() {
        let instance = Instance::new("Sample", ());
        let unit = Unit::new("t", noop).on_instance(instance.clone());
        assert_eq!(unit.class, "Sample");
        assert_eq!(unit.instance, Some(instance));

        let explicit = Unit::new("t", noop)
            .in_class("Other")
            .on_instance(Instance::new("Sample", ()));
        assert_eq!(explicit.class, "Other");
    }

    #[test]
    fn debug_omits_body() {
        let rendered = format!("{:?}", Unit::new("t", noop));
        assert!(rendered.contains("\"t\""));
    }
}
