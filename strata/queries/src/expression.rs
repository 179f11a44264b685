use std::collections::HashMap;

/// The predicate capability consumed by [filter](crate::QueryProcessor::filter).
///
/// Parsing filter expressions is out of scope for this crate; callers
/// supply any tree-like evaluator behind this trait. Attribute values
/// are bound by name, widened to `f64` (the first element for
/// multi-valued and variable-sized cells).
pub trait ExpressionTree {
    /// The attribute names the expression reads. Only these attributes
    /// are walked eagerly during a filter scan.
    fn vars(&self) -> Vec<String>;

    /// Evaluates the predicate against one cell's variable bindings.
    fn evaluate(&self, bindings: &HashMap<String, f64>) -> bool;
}

/// An [ExpressionTree] backed by a closure; the simplest way to run a
/// filter programmatically.
pub struct FnExpression<F> {
    vars: Vec<String>,
    predicate: F,
}

impl<F> FnExpression<F>
where
    F: Fn(&HashMap<String, f64>) -> bool,
{
    pub fn new<S: Into<String>>(vars: Vec<S>, predicate: F) -> Self {
        FnExpression {
            vars: vars.into_iter().map(Into::into).collect(),
            predicate,
        }
    }
}

impl<F> ExpressionTree for FnExpression<F>
where
    F: Fn(&HashMap<String, f64>) -> bool,
{
    fn vars(&self) -> Vec<String> {
        self.vars.clone()
    }

    fn evaluate(&self, bindings: &HashMap<String, f64>) -> bool {
        (self.predicate)(bindings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_expression_binds_by_name() {
        let expr = FnExpression::new(vec!["a"], |b| b["a"] > 2.0);
        assert_eq!(vec!["a".to_owned()], expr.vars());

        let mut bindings = HashMap::new();
        bindings.insert("a".to_owned(), 3.0);
        assert!(expr.evaluate(&bindings));
        bindings.insert("a".to_owned(), 1.0);
        assert!(!expr.evaluate(&bindings));
    }
}
