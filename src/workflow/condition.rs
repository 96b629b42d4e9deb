/// Edge condition evaluation
///
/// CONDITION edges carry a boolean expression evaluated against the source
/// node's output. The executor only sees `ConditionEvaluator`; the default
/// implementation runs the expression in a fresh, stripped-down Lua state.

use crate::error::ConditionEvalError;
use mlua::{Lua, LuaSerdeExt};
use serde_json::Value;

/// Pluggable `Evaluate(expression, context) -> bool`
///
/// Each top-level key of `context` is visible to the expression by name.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, context: &Value) -> Result<bool, ConditionEvalError>;
}

/// Identifiers an expression may not mention
const BLOCKED_TOKENS: [&str; 18] = [
    "function", "while", "repeat", "for", "goto", "load", "loadstring", "dofile",
    "loadfile", "require", "rawget", "rawset", "getmetatable", "setmetatable",
    "collectgarbage", "coroutine", "_G", "_ENV",
];

/// Lua-backed evaluator (expressions like `output.status == 200 and vars.env ~= "prod"`)
#[derive(Debug, Clone)]
pub struct LuaConditionEvaluator {
    memory_limit: usize,
}

impl Default for LuaConditionEvaluator {
    fn default() -> Self {
        Self {
            memory_limit: 8 * 1024 * 1024,
        }
    }
}

impl LuaConditionEvaluator {
    fn sandbox(&self) -> mlua::Result<Lua> {
        let lua = Lua::new();
        lua.set_memory_limit(self.memory_limit)?;

        let globals = lua.globals();
        for name in ["os", "io", "debug", "package"] {
            globals.set(name, mlua::Nil)?;
        }

        Ok(lua)
    }
}

impl ConditionEvaluator for LuaConditionEvaluator {
    fn evaluate(&self, expression: &str, context: &Value) -> Result<bool, ConditionEvalError> {
        let fail = |reason: String| ConditionEvalError {
            expression: expression.to_string(),
            reason,
        };

        if let Some(token) = blocked_token(expression) {
            return Err(fail(format!("`{token}` is not allowed in conditions")));
        }

        let lua = self.sandbox().map_err(|e| fail(e.to_string()))?;
        let globals = lua.globals();

        if let Value::Object(vars) = context {
            for (name, value) in vars {
                let value = lua.to_value(value).map_err(|e| fail(e.to_string()))?;
                globals.set(name.as_str(), value).map_err(|e| fail(e.to_string()))?;
            }
        }

        let result = lua
            .load(format!("return ({expression})"))
            .set_name("condition")
            .eval::<mlua::Value>()
            .map_err(|e| fail(e.to_string()))?;

        match result {
            mlua::Value::Boolean(b) => Ok(b),
            other => Err(fail(format!(
                "expected a boolean, got {}",
                other.type_name()
            ))),
        }
    }
}

fn blocked_token(expression: &str) -> Option<&'static str> {
    expression
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .find_map(|token| BLOCKED_TOKENS.iter().copied().find(|blocked| *blocked == token))
}
