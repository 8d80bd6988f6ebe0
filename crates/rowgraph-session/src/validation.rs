//! Validation hooks run on pending objects before a commit reaches storage.

use regex::Regex;

use rowgraph_core::{Error, Result, ValidationFailure};

use crate::object::DomainObject;

/// A check run on every created or updated object during VALIDATING.
///
/// Hooks add their findings to `failure`; a commit aborts when any object
/// ends up with at least one error.
pub trait ValidationHook: Send + Sync {
    fn validate(&self, object: &DomainObject, failure: &mut ValidationFailure);
}

impl<F> ValidationHook for F
where
    F: Fn(&DomainObject, &mut ValidationFailure) + Send + Sync,
{
    fn validate(&self, object: &DomainObject, failure: &mut ValidationFailure) {
        self(object, failure);
    }
}

/// Rejects NULL in attributes declared non-nullable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotNullRule;

impl ValidationHook for NotNullRule {
    fn validate(&self, object: &DomainObject, failure: &mut ValidationFailure) {
        let attributes = object.descriptor().attributes();
        for (attribute, value) in attributes.iter().zip(object.values()) {
            if !attribute.nullable && value.is_null() {
                failure.add(attribute.name, "must not be null");
            }
        }
    }
}

/// Requires a text attribute to match a regular expression.
///
/// NULL values pass; combine with [`NotNullRule`] to require a value.
#[derive(Debug, Clone)]
pub struct PatternRule {
    entity: &'static str,
    attribute: &'static str,
    pattern: Regex,
}

impl PatternRule {
    pub fn new(entity: &'static str, attribute: &'static str, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("invalid pattern for {entity}.{attribute}: {e}")))?;
        Ok(Self {
            entity,
            attribute,
            pattern,
        })
    }
}

impl ValidationHook for PatternRule {
    fn validate(&self, object: &DomainObject, failure: &mut ValidationFailure) {
        if !object.descriptor().is_a(self.entity) {
            return;
        }
        let Ok(value) = object.get(self.attribute) else {
            return;
        };
        if value.is_null() {
            return;
        }
        match value.as_str() {
            Some(text) if self.pattern.is_match(text) => {}
            Some(_) => failure.add(
                self.attribute,
                format!("does not match pattern '{}'", self.pattern.as_str()),
            ),
            None => failure.add(self.attribute, "is not text"),
        }
    }
}

/// Run every hook on `object`.
pub(crate) fn validate_object(
    hooks: &[std::sync::Arc<dyn ValidationHook>],
    object: &DomainObject,
) -> Result<()> {
    let mut failure = ValidationFailure::new(object.identity().clone());
    for hook in hooks {
        hook.validate(object, &mut failure);
    }
    failure.into_result()
}
