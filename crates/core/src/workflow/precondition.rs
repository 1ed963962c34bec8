use crate::step::Condition;
use std::collections::HashMap;

/// Evaluates a single precondition
#[async_trait::async_trait]
pub trait ConditionEvaluator: Send + Sync {
    /// Returns whether the condition holds. An error counts as not holding.
    async fn evaluate(
        &self,
        condition: &Condition,
        env: &HashMap<String, String>,
    ) -> anyhow::Result<bool>;
}

/// Expands `$VAR` and `${VAR}` references in the condition and compares the
/// result with the expected value
///
/// Variables resolve from the step environment first, then the process
/// environment. Unknown variables expand to an empty string.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvConditionEvaluator;

#[async_trait::async_trait]
impl ConditionEvaluator for EnvConditionEvaluator {
    async fn evaluate(
        &self,
        condition: &Condition,
        env: &HashMap<String, String>,
    ) -> anyhow::Result<bool> {
        let actual = expand_variables(&condition.condition, env)?;
        Ok(actual.trim() == condition.expected.trim())
    }
}

/// Result of running the precondition gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreconditionOutcome {
    Met,
    Unmet {
        /// Position of the first condition that did not hold
        index: usize,
        condition: Condition,
        reason: String,
    },
}

impl PreconditionOutcome {
    pub fn is_met(&self) -> bool {
        matches!(self, Self::Met)
    }
}

/// Evaluate conditions in declared order, stopping at the first one that is
/// false or fails to evaluate
pub async fn check_preconditions(
    evaluator: &dyn ConditionEvaluator,
    conditions: &[Condition],
    env: &HashMap<String, String>,
) -> PreconditionOutcome {
    for (index, condition) in conditions.iter().enumerate() {
        let reason = match evaluator.evaluate(condition, env).await {
            Ok(true) => continue,
            Ok(false) => format!("condition not met: {}", condition),
            Err(e) => format!("condition failed: {}: {}", condition, e),
        };

        tracing::debug!("Precondition {} unmet: {}", index, reason);
        return PreconditionOutcome::Unmet {
            index,
            condition: condition.clone(),
            reason,
        };
    }

    PreconditionOutcome::Met
}

fn lookup(name: &str, env: &HashMap<String, String>) -> String {
    env.get(name)
        .cloned()
        .or_else(|| std::env::var(name).ok())
        .unwrap_or_default()
}

/// Expand `$VAR` and `${VAR}` references
pub fn expand_variables(input: &str, env: &HashMap<String, String>) -> anyhow::Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            Some('{') => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    return Err(anyhow::anyhow!("Unterminated variable reference in {}", input));
                }
                out.push_str(&lookup(&name, env));
            }
            Some(c) if c.is_ascii_alphanumeric() || *c == '_' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&lookup(&name, env));
            }
            _ => out.push('$'),
        }
    }

    Ok(out)
}
