//! Embedded Lua host producing grammars for the inference loop.
//!
//! A grammar script is a small Lua program with two entry points:
//!
//! - `start()` — required; returns the grammar string used for sampling.
//! - `on_eos(text)` — optional; called when the model emits its end-of-stream
//!   token, with the text generated since the previous grammar switch.
//!   Returning a string installs it as the new grammar and generation
//!   continues; returning `nil` ends generation.
//!
//! The interpreter is sandboxed to the base, `string` and `table` libraries,
//! plus a pure `json.encode` helper. Any error thrown by the script (at
//! load, in `start()` or in `on_eos`) terminates inference with
//! [`Error::GrammarScript`].

use mlua::{Function, Lua, LuaOptions, StdLib, Value};

use crate::error::{Error, Result};

pub struct GrammarHost {
    lua: Lua,
    on_eos: Option<Function>,
}

impl GrammarHost {
    /// Execute `script` in a fresh sandboxed state and capture its hooks.
    pub fn new(script: &str) -> Result<Self> {
        let lua = Lua::new_with(StdLib::STRING | StdLib::TABLE, LuaOptions::default())
            .map_err(script_err)?;

        // `json.encode` is the only way out of the sandbox: a pure
        // value-to-string conversion.
        let json = lua.create_table().map_err(script_err)?;
        let encode = lua
            .create_function(|_, value: Value| {
                serde_json::to_string(&value).map_err(mlua::Error::external)
            })
            .map_err(script_err)?;
        json.set("encode", encode).map_err(script_err)?;
        lua.globals().set("json", json).map_err(script_err)?;

        lua.load(script).exec().map_err(script_err)?;

        let on_eos = lua
            .globals()
            .get::<Option<Function>>("on_eos")
            .map_err(script_err)?;

        Ok(GrammarHost { lua, on_eos })
    }

    /// Call the script's `start()`, which must return the initial grammar.
    pub fn start(&self) -> Result<String> {
        let start: Function = self
            .lua
            .globals()
            .get("start")
            .map_err(|_| Error::GrammarScript("script does not define start()".into()))?;
        start.call::<String>(()).map_err(script_err)
    }

    pub fn has_on_eos(&self) -> bool {
        self.on_eos.is_some()
    }

    /// Invoke `on_eos` with the accumulated output. `Ok(None)` means the
    /// script chose to end generation.
    pub fn on_eos(&self, text: &str) -> Result<Option<String>> {
        match &self.on_eos {
            Some(hook) => hook.call::<Option<String>>(text).map_err(script_err),
            None => Ok(None),
        }
    }
}

fn script_err(e: mlua::Error) -> Error {
    Error::GrammarScript(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_returns_grammar() {
        let host = GrammarHost::new(r#"function start() return "root ::= 'a'" end"#).unwrap();
        assert_eq!(host.start().unwrap(), "root ::= 'a'");
        assert!(!host.has_on_eos());
    }

    #[test]
    fn on_eos_switches_then_stops() {
        let host = GrammarHost::new(
            r#"
            calls = 0
            function start() return "G1" end
            function on_eos(text)
                calls = calls + 1
                if calls == 1 then return "G2" end
                return nil
            end
            "#,
        )
        .unwrap();

        assert!(host.has_on_eos());
        assert_eq!(host.on_eos("first").unwrap(), Some("G2".into()));
        assert_eq!(host.on_eos("second").unwrap(), None);
    }

    #[test]
    fn on_eos_receives_accumulated_text() {
        let host = GrammarHost::new(
            r#"
            function start() return "G" end
            function on_eos(text) return "len:" .. tostring(#text) end
            "#,
        )
        .unwrap();

        assert_eq!(host.on_eos("abcd").unwrap(), Some("len:4".into()));
    }

    #[test]
    fn json_encode_is_available() {
        let host = GrammarHost::new(
            r#"
            function start()
                return json.encode({ kind = "grammar" })
            end
            "#,
        )
        .unwrap();

        assert_eq!(host.start().unwrap(), r#"{"kind":"grammar"}"#);
    }

    #[test]
    fn missing_start_is_a_script_error() {
        let host = GrammarHost::new("x = 1").unwrap();
        assert!(matches!(host.start(), Err(Error::GrammarScript(_))));
    }

    #[test]
    fn load_error_is_a_script_error() {
        assert!(matches!(
            GrammarHost::new("this is not lua"),
            Err(Error::GrammarScript(_))
        ));
    }

    #[test]
    fn sandbox_has_no_io() {
        let host = GrammarHost::new(
            r#"
            function start()
                if io == nil and os == nil then return "sealed" end
                return "leaky"
            end
            "#,
        )
        .unwrap();

        assert_eq!(host.start().unwrap(), "sealed");
    }

    #[test]
    fn runtime_error_in_start_is_reported() {
        let host = GrammarHost::new(r#"function start() error("boom") end"#).unwrap();
        assert!(matches!(host.start(), Err(Error::GrammarScript(_))));
    }
}
