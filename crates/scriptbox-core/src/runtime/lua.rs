//! Lua 5.4 runtime.
//!
//! Every session gets a fresh interpreter created on its worker thread. The
//! host state only opens `base`, `table`, `string`, `math` and `utf8`; the
//! script itself sees nothing but an environment table built from the
//! capability registry, guarded by a locked metatable:
//!
//! - reading a denied name raises a capability fault and is audited
//! - reading any other unassigned name raises a name fault
//!
//! Cancellation is checked by an instruction-count hook, by output writes and
//! by `time.sleep`. A single long-running library call (`string.rep` with a
//! huge count, `table.sort` on a huge table) is not interruptible while it
//! runs; the interrupt lands at the next check point after it returns.

use std::cell::RefCell;
use std::rc::Rc;

use mlua::{Function, HookTriggers, Lua, LuaOptions, MultiValue, StdLib, Table, Value, VmState};

use super::builtins::{self, NativeEnv, LOADED_KEY};
use super::{ScriptRuntime, WorkerContext};
use crate::capability::{Builtin, ModuleFacade, ModuleSource};
use crate::classifier::{
    fault_from_error, termination_from_error, termination_from_message, ScriptAbort, Termination,
};
use crate::domain::TraceFrame;

const MAX_TRACE_FRAMES: usize = 32;

/// Production runtime backed by an embedded Lua 5.4 interpreter.
#[derive(Debug, Clone, Copy, Default)]
pub struct LuaRuntime;

impl LuaRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl ScriptRuntime for LuaRuntime {
    fn name(&self) -> &'static str {
        "lua54"
    }

    fn execute(&self, source: &str, ctx: &WorkerContext) -> Termination {
        if ctx.cancel.is_requested() {
            return Termination::Interrupted;
        }
        match run(source, ctx) {
            Ok(termination) => termination,
            Err(err) => termination_from_error(&err, Vec::new(), &ctx.limits.chunk_name),
        }
    }
}

fn run(source: &str, ctx: &WorkerContext) -> mlua::Result<Termination> {
    let chunk_name = ctx.limits.chunk_name.as_str();
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
        LuaOptions::new(),
    )?;
    if let Some(limit) = ctx.limits.memory_limit_bytes {
        lua.set_memory_limit(limit)?;
    }

    let env = build_environment(&lua, ctx)?;
    let func = match lua
        .load(source)
        .set_name(format!("={chunk_name}"))
        .set_environment(env)
        .into_function()
    {
        Ok(func) => func,
        Err(err) => {
            return Ok(Termination::Raised(fault_from_error(
                &err,
                Vec::new(),
                chunk_name,
            )))
        }
    };

    let cancel = ctx.cancel.clone();
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(ctx.limits.check_interval),
        move |_, _| {
            if cancel.is_requested() {
                Err(ScriptAbort::Interrupted.into_lua())
            } else {
                Ok(VmState::Continue)
            }
        },
    );

    let frames = Rc::new(RefCell::new(Vec::new()));
    let handler = {
        let frames = Rc::clone(&frames);
        lua.create_function(move |lua, err: Value| {
            *frames.borrow_mut() = capture_trace(lua);
            Ok(err)
        })?
    };
    let xpcall: Function = lua.globals().raw_get("xpcall")?;
    let outcome = xpcall.call::<MultiValue>((func, handler));
    lua.remove_hook();

    let trace = frames.take();
    Ok(interpret(outcome?, trace, chunk_name))
}

/// Map `xpcall`'s return values to a termination.
fn interpret(outcome: MultiValue, trace: Vec<TraceFrame>, chunk_name: &str) -> Termination {
    let mut values = outcome.into_iter();
    if let Some(Value::Boolean(true)) = values.next() {
        return Termination::Returned;
    }
    match values.next() {
        Some(Value::Error(err)) => termination_from_error(&err, trace, chunk_name),
        Some(Value::String(s)) => {
            termination_from_message(s.to_string_lossy().to_string(), trace, chunk_name)
        }
        Some(other) => termination_from_message(
            format!("error object is a {} value", other.type_name()),
            trace,
            chunk_name,
        ),
        None => termination_from_message("unknown error".to_string(), trace, chunk_name),
    }
}

/// Lua frames from the raise site outwards to the main chunk, returned
/// innermost-last. C frames are skipped.
fn capture_trace(lua: &Lua) -> Vec<TraceFrame> {
    let mut frames = Vec::new();
    let mut level = 1;
    while let Some(debug) = lua.inspect_stack(level) {
        level += 1;
        let source = debug.source();
        if source.what == "C" {
            continue;
        }
        let is_main = source.what == "main";
        let symbol = match debug.names().name {
            Some(name) => name.to_string(),
            None if is_main => "main chunk".to_string(),
            None => "?".to_string(),
        };
        frames.push(TraceFrame {
            symbol,
            source: source.short_src.map(|s| s.to_string()),
            line: u32::try_from(debug.curr_line()).ok().filter(|l| *l > 0),
        });
        if is_main || frames.len() >= MAX_TRACE_FRAMES {
            break;
        }
    }
    frames.reverse();
    frames
}

/// Materialize the registry as the script's global environment.
fn build_environment(lua: &Lua, ctx: &WorkerContext) -> mlua::Result<Table> {
    let globals = lua.globals();
    let natives = NativeEnv::new(ctx.clone());
    let env = lua.create_table()?;

    let loaded = lua.create_table()?;
    for facade in ctx.registry.modules() {
        let module = build_module(lua, &globals, facade, &natives)?;
        loaded.raw_set(facade.name, module.clone())?;
        env.raw_set(facade.name, module)?;
    }
    lua.set_named_registry_value(LOADED_KEY, loaded)?;

    for (name, builtin) in ctx.registry.symbols() {
        let value = match builtin {
            Builtin::Base(host) => globals.raw_get::<Value>(*host)?,
            Builtin::Library { library, member } => {
                let lib: Table = if *library == "_G" {
                    globals.clone()
                } else {
                    globals.raw_get(*library)?
                };
                lib.raw_get::<Value>(*member)?
            }
            Builtin::Native(native) => {
                Value::Function(builtins::create_native(lua, *native, &natives)?)
            }
        };
        env.raw_set(name, value)?;
    }

    // Method calls on strings go through the filtered facade too.
    let getmetatable: Function = globals.raw_get("getmetatable")?;
    if let Value::Table(string_meta) = getmetatable.call::<Value>("")? {
        string_meta.raw_set("__index", env.raw_get::<Value>("string")?)?;
    }

    install_guard(lua, &env, ctx)?;
    Ok(env)
}

fn build_module(
    lua: &Lua,
    globals: &Table,
    facade: &ModuleFacade,
    natives: &NativeEnv,
) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    match facade.source {
        ModuleSource::Stdlib { library, members } => {
            let lib: Table = globals.raw_get(library)?;
            for member in members {
                module.raw_set(*member, lib.raw_get::<Value>(*member)?)?;
            }
        }
        ModuleSource::Native(members) => {
            for (name, native) in members {
                module.raw_set(*name, builtins::create_native(lua, *native, natives)?)?;
            }
        }
    }
    Ok(module)
}

fn install_guard(lua: &Lua, env: &Table, ctx: &WorkerContext) -> mlua::Result<()> {
    let guard_ctx = ctx.clone();
    let index = lua.create_function(move |_, (_, key): (Table, Value)| -> mlua::Result<Value> {
        let name = match key {
            Value::String(s) => s.to_string_lossy().to_string(),
            _ => return Ok(Value::Nil),
        };
        match guard_ctx.registry.denial(&name) {
            Some(reason) => Err(builtins::deny(&guard_ctx, &name, reason)),
            None => Err(ScriptAbort::UndefinedName(name).into_lua()),
        }
    })?;

    let meta = lua.create_table()?;
    meta.raw_set("__index", index)?;
    meta.raw_set("__metatable", "locked")?;
    let setmetatable: Function = lua.globals().raw_get("setmetatable")?;
    setmetatable.call::<()>((env.clone(), meta))
}
