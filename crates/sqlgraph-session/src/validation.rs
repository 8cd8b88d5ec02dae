//! Field constraints and entity rules checked by the flush.
//!
//! Every failure across every entity is collected into one
//! [`ValidationErrors`] so callers can report them together.

use crate::entity::EntityRef;
use crate::manager::EntityManager;
use crate::metadata::FieldKind;
use regex::Regex;
use sqlgraph_core::{
    ConfigError, Cx, Error, Outcome, Result, ValidationErrorKind, ValidationErrors, Value,
    try_outcome,
};
use std::collections::HashMap;

/// Compiles each pattern once per flush.
#[derive(Default)]
pub(crate) struct Validator {
    patterns: HashMap<&'static str, Regex>,
}

impl Validator {
    fn pattern(&mut self, pattern: &'static str) -> Result<&Regex> {
        if !self.patterns.contains_key(pattern) {
            let regex = Regex::new(pattern).map_err(|e| {
                Error::Config(ConfigError {
                    message: format!("invalid field pattern '{pattern}'"),
                    source: Some(Box::new(e)),
                })
            })?;
            self.patterns.insert(pattern, regex);
        }
        Ok(&self.patterns[pattern])
    }

    /// Column constraints, enum variants and entity rules.
    pub fn validate(&mut self, entities: &[EntityRef]) -> Result<ValidationErrors> {
        let mut errors = ValidationErrors::new();
        for entity in entities {
            self.validate_entity(entity, &mut errors)?;
        }
        Ok(errors)
    }

    fn validate_entity(&mut self, entity: &EntityRef, errors: &mut ValidationErrors) -> Result<()> {
        let meta = entity.meta();
        let label = entity.to_string();
        for field in &meta.fields {
            let slot = entity.slot(field.id);
            if field.is_required() && slot.is_null() {
                errors.add_required(label.clone(), field.name);
                continue;
            }
            let value = entity.slot_value(field.id);
            match &field.kind {
                FieldKind::Primitive {
                    max_length,
                    pattern,
                    ..
                } => {
                    let Value::Text(text) = &value else {
                        continue;
                    };
                    if let Some(max) = max_length {
                        let length = text.chars().count();
                        if length > *max {
                            errors.add_max_length(label.clone(), field.name, *max, length);
                        }
                    }
                    if let Some(pattern) = pattern {
                        if !self.pattern(pattern)?.is_match(text) {
                            errors.add_pattern(label.clone(), field.name, pattern);
                        }
                    }
                }
                FieldKind::Enum { variants, .. } => {
                    if let Value::Text(text) = &value {
                        if !variants.contains(&text.as_str()) {
                            errors.add(
                                label.clone(),
                                Some(field.name),
                                ValidationErrorKind::Custom,
                                format!("{} must be one of {}", field.name, variants.join(", ")),
                            );
                        }
                    }
                }
                _ => {}
            }
        }
        for rule in &meta.rules {
            if let Err(message) = (rule.check)(entity) {
                errors.add(label.clone(), None, ValidationErrorKind::Custom, message);
            }
        }
        Ok(())
    }
}

/// Run reactive rules, loading each rule's hint first.
pub(crate) async fn run_reactive_rules(
    em: &EntityManager,
    cx: &Cx,
    rules: &[(EntityRef, usize)],
) -> Outcome<ValidationErrors, Error> {
    let live: Vec<&(EntityRef, usize)> = rules.iter().filter(|(e, _)| !e.is_deleted()).collect();
    let loads = live.iter().filter_map(|(entity, index)| {
        let rule = entity.meta().reactive_rules.get(*index)?;
        Some(em.populate(cx, std::slice::from_ref(entity), rule.hint.clone()))
    });
    for outcome in futures::future::join_all(loads).await {
        try_outcome!(outcome);
    }

    let mut errors = ValidationErrors::new();
    for (entity, index) in live {
        let Some(rule) = entity.meta().reactive_rules.get(*index) else {
            continue;
        };
        if let Err(message) = (rule.check)(entity) {
            errors.add(
                entity.to_string(),
                None,
                ValidationErrorKind::Reactive,
                message,
            );
        }
    }
    Outcome::Ok(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Slot;
    use crate::metadata::{EntityBuilder, EntityMetadata, Field};
    use sqlgraph_core::IdValue;
    use std::rc::Weak;
    use std::sync::Arc;

    fn meta() -> Arc<EntityMetadata> {
        Arc::new(
            EntityBuilder::new("Author", "a", "authors")
                .primary_key("id")
                .field(Field::primitive("first_name").required().max_length(5))
                .field(Field::primitive("email").pattern(r"^[^@]+@[^@]+$"))
                .field(Field::enumeration("status", &["active", "retired"]))
                .rule("not bob", |e| match e.get_by_name("first_name") {
                    Ok(Value::Text(name)) if name == "bob" => Err("bob is not allowed".to_string()),
                    _ => Ok(()),
                })
                .finish(0)
                .unwrap(),
        )
    }

    fn author(values: [Value; 3]) -> EntityRef {
        let [first, email, status] = values;
        EntityRef::new(
            meta(),
            Weak::new(),
            1,
            Some(IdValue::Int(1)),
            vec![
                Slot::Value(Value::BigInt(1)),
                Slot::Value(first),
                Slot::Value(email),
                Slot::Value(status),
            ],
            false,
        )
    }

    #[test]
    fn valid_entity_passes() {
        let a = author([
            Value::from("ann"),
            Value::from("ann@example.com"),
            Value::from("active"),
        ]);
        let errors = Validator::default().validate(&[a]).unwrap();
        assert!(errors.is_empty());
    }

    #[test]
    fn every_failure_is_collected() {
        let a = author([
            Value::from("ann-marie"),
            Value::from("not-an-email"),
            Value::from("gone"),
        ]);
        let b = author([Value::Null, Value::Null, Value::Null]);
        let errors = Validator::default().validate(&[a, b]).unwrap();
        let kinds: Vec<_> = errors.errors.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ValidationErrorKind::MaxLength,
                ValidationErrorKind::Pattern,
                ValidationErrorKind::Custom,
                ValidationErrorKind::Required,
            ]
        );
        assert_eq!(errors.errors[0].entity, "Author#a:1");
        assert_eq!(
            errors.messages()[0],
            "first_name must be at most 5 characters, got 9"
        );
        assert_eq!(errors.messages()[2], "status must be one of active, retired");
    }

    #[test]
    fn max_length_counts_characters() {
        let a = author([Value::from("ñañañ"), Value::Null, Value::Null]);
        assert!(Validator::default().validate(&[a]).unwrap().is_empty());
    }

    #[test]
    fn entity_rules_run() {
        let a = author([Value::from("bob"), Value::Null, Value::Null]);
        let errors = Validator::default().validate(&[a]).unwrap();
        assert_eq!(errors.messages(), vec!["bob is not allowed"]);
        assert_eq!(errors.errors[0].field, None);
    }
}
