//! Rule implementations that ship with the engine.

mod file_naming;
mod frontmatter;
mod trailing_whitespace;

pub use file_naming::{FileNamingRule, NamingStyle};
pub use frontmatter::RequiredFieldsRule;
pub use trailing_whitespace::TrailingWhitespaceRule;

use crate::rule::{Rule, RuleFactory, RuleSpec};
use std::sync::Arc;

/// Register every built-in rule family, keyed by its `major` id.
pub fn register(factory: &mut RuleFactory) {
    factory.register(frontmatter::MAJOR, |spec| {
        Ok(Arc::new(RequiredFieldsRule::new(spec)?) as Arc<dyn Rule>)
    });
    factory.register(trailing_whitespace::MAJOR, |spec| {
        Ok(Arc::new(TrailingWhitespaceRule::new(spec)) as Arc<dyn Rule>)
    });
    factory.register(file_naming::MAJOR, |spec| {
        Ok(Arc::new(FileNamingRule::new(spec)?) as Arc<dyn Rule>)
    });
}

fn with_default_category(mut spec: RuleSpec, category: &str) -> RuleSpec {
    if spec.category.is_empty() {
        spec.category = category.to_string();
    }
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RuleIdentity;

    #[test]
    fn test_builtin_families_are_registered() {
        let factory = RuleFactory::with_builtin_rules();
        for full in [
            "frontmatter-required-fields.strict",
            "trailing-whitespace.default",
            "file-naming.kebab-case",
        ] {
            let identity = RuleIdentity::parse(full).unwrap();
            assert!(factory.is_registered(&identity), "{full}");
            let rule = factory.create(RuleSpec::new(identity, "")).unwrap();
            assert!(!rule.category().is_empty());
        }
    }

    #[test]
    fn test_unknown_naming_style_is_rejected() {
        let factory = RuleFactory::with_builtin_rules();
        let spec = RuleSpec::new(RuleIdentity::new("file-naming", "shouting"), "file-naming");
        assert!(factory.create(spec).is_err());
    }
}
