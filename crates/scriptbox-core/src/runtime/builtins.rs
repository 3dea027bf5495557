//! Engine-provided functions exposed to Lua scripts.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use mlua::{Function, Lua, LuaSerdeExt, MultiValue, Table, Value};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use super::WorkerContext;
use crate::capability::Native;
use crate::classifier::{error_message, is_uncatchable, ScriptAbort};
use crate::metrics::METRICS;
use crate::obs;
use crate::session::lock;
use crate::sink::{SinkError, StreamKind};

/// Cancellation is polled this often inside native loops.
const NATIVE_CHECK_EVERY: usize = 4096;
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Registry key of the table `require` serves modules from.
pub(super) const LOADED_KEY: &str = "scriptbox.loaded";

/// State shared by the natives of one session.
#[derive(Clone)]
pub(super) struct NativeEnv {
    ctx: WorkerContext,
    rng: Arc<Mutex<StdRng>>,
    started: Instant,
}

impl NativeEnv {
    pub(super) fn new(ctx: WorkerContext) -> Self {
        Self {
            ctx,
            rng: Arc::new(Mutex::new(StdRng::from_os_rng())),
            started: Instant::now(),
        }
    }
}

/// Record and raise a capability denial.
pub(super) fn deny(ctx: &WorkerContext, name: &str, reason: &str) -> mlua::Error {
    obs::emit_capability_denied(&ctx.session_id, name, reason);
    METRICS.inc_capability_denials();
    ScriptAbort::CapabilityDenied {
        name: name.to_string(),
        reason: reason.to_string(),
    }
    .into_lua()
}

fn type_error(msg: impl Into<String>) -> mlua::Error {
    ScriptAbort::TypeMismatch(msg.into()).into_lua()
}

fn check_cancel(ctx: &WorkerContext) -> mlua::Result<()> {
    if ctx.cancel.is_requested() {
        return Err(ScriptAbort::Interrupted.into_lua());
    }
    Ok(())
}

fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Nil | Value::Boolean(false))
}

pub(super) fn create_native(lua: &Lua, native: Native, env: &NativeEnv) -> mlua::Result<Function> {
    let ctx = env.ctx.clone();
    match native {
        Native::Print => lua.create_function(move |lua, args: MultiValue| {
            emit(lua, &ctx, StreamKind::Stdout, args)
        }),
        Native::Eprint => lua.create_function(move |lua, args: MultiValue| {
            emit(lua, &ctx, StreamKind::Stderr, args)
        }),
        Native::Require => lua.create_function(move |lua, name: mlua::String| {
            let name = name.to_string_lossy().to_string();
            if ctx.registry.module(&name).is_some() {
                let loaded: Table = lua.named_registry_value(LOADED_KEY)?;
                return loaded.raw_get::<Table>(name.as_str());
            }
            let reason = ctx
                .registry
                .denial(&name)
                .unwrap_or("module is not in the allow-list");
            Err(deny(&ctx, &name, reason))
        }),
        Native::Pcall => lua.create_function(|lua, (f, args): (Value, MultiValue)| {
            let func = match f {
                Value::Function(func) => func,
                other => {
                    let msg = format!("attempt to call a {} value", other.type_name());
                    return Ok(MultiValue::from_vec(vec![
                        Value::Boolean(false),
                        Value::String(lua.create_string(&msg)?),
                    ]));
                }
            };
            match func.call::<MultiValue>(args) {
                Ok(values) => {
                    let mut out = vec![Value::Boolean(true)];
                    out.extend(values);
                    Ok(MultiValue::from_vec(out))
                }
                Err(err) if is_uncatchable(&err) => Err(err),
                Err(err) => Ok(MultiValue::from_vec(vec![
                    Value::Boolean(false),
                    Value::String(lua.create_string(error_message(&err))?),
                ])),
            }
        }),
        Native::SetMetatable => lua.create_function(move |lua, (t, mt): (Table, Value)| {
            if let Value::Table(meta) = &mt {
                if !meta.raw_get::<Value>("__gc")?.is_nil() {
                    return Err(deny(&ctx, "__gc", "finalizers are not permitted"));
                }
            }
            let host: Function = lua.globals().raw_get("setmetatable")?;
            host.call::<Table>((t, mt))
        }),
        Native::Len => lua.create_function(|_, value: Value| match value {
            Value::String(s) => Ok(s.as_bytes().len() as i64),
            Value::Table(t) => Ok(t.raw_len() as i64),
            other => Err(type_error(format!(
                "len() of a {} value",
                other.type_name()
            ))),
        }),
        Native::Range => lua.create_function(
            move |lua, (a, b, step): (i64, Option<i64>, Option<i64>)| {
                let (start, stop) = match b {
                    Some(b) => (a, b),
                    None => (1, a),
                };
                let step = step.unwrap_or(1);
                if step == 0 {
                    return Err(type_error("range() step must not be zero"));
                }
                let out = lua.create_table()?;
                let mut current = start;
                let mut index = 1usize;
                while (step > 0 && current <= stop) || (step < 0 && current >= stop) {
                    out.raw_set(index, current)?;
                    if index % NATIVE_CHECK_EVERY == 0 {
                        check_cancel(&ctx)?;
                    }
                    index += 1;
                    current = match current.checked_add(step) {
                        Some(next) => next,
                        None => break,
                    };
                }
                Ok(out)
            },
        ),
        Native::Sorted => lua.create_function(|lua, (t, cmp): (Table, Option<Function>)| {
            let copy = lua.create_table()?;
            for (i, value) in t.sequence_values::<Value>().enumerate() {
                copy.raw_set(i + 1, value?)?;
            }
            let table_lib: Table = lua.globals().raw_get("table")?;
            let sort: Function = table_lib.raw_get("sort")?;
            match cmp {
                Some(cmp) => sort.call::<()>((copy.clone(), cmp))?,
                None => sort.call::<()>(copy.clone())?,
            }
            Ok(copy)
        }),
        Native::Sum => lua.create_function(|_, t: Table| {
            let mut int_total: i64 = 0;
            let mut float_total = 0.0f64;
            let mut integral = true;
            for value in t.sequence_values::<Value>() {
                match value? {
                    Value::Integer(i) if integral => match int_total.checked_add(i) {
                        Some(total) => int_total = total,
                        None => {
                            integral = false;
                            float_total = int_total as f64 + i as f64;
                        }
                    },
                    Value::Integer(i) => float_total += i as f64,
                    Value::Number(n) => {
                        if integral {
                            integral = false;
                            float_total = int_total as f64;
                        }
                        float_total += n;
                    }
                    other => {
                        return Err(type_error(format!(
                            "sum() of a sequence containing a {} value",
                            other.type_name()
                        )))
                    }
                }
            }
            Ok(if integral {
                Value::Integer(int_total)
            } else {
                Value::Number(float_total)
            })
        }),
        Native::Keys => lua.create_function(|lua, t: Table| {
            let out = lua.create_table()?;
            for (i, pair) in t.pairs::<Value, Value>().enumerate() {
                let (key, _) = pair?;
                out.raw_set(i + 1, key)?;
            }
            Ok(out)
        }),
        Native::Set => lua.create_function(|lua, t: Table| {
            let out = lua.create_table()?;
            for value in t.sequence_values::<Value>() {
                out.raw_set(value?, true)?;
            }
            Ok(out)
        }),
        Native::Map => lua.create_function(|lua, (f, t): (Function, Table)| {
            let out = lua.create_table()?;
            for (i, value) in t.sequence_values::<Value>().enumerate() {
                out.raw_set(i + 1, f.call::<Value>(value?)?)?;
            }
            Ok(out)
        }),
        Native::Filter => lua.create_function(|lua, (f, t): (Function, Table)| {
            let out = lua.create_table()?;
            let mut next = 1usize;
            for value in t.sequence_values::<Value>() {
                let value = value?;
                if truthy(&f.call::<Value>(value.clone())?) {
                    out.raw_set(next, value)?;
                    next += 1;
                }
            }
            Ok(out)
        }),
        Native::Zip => lua.create_function(|lua, (a, b): (Table, Table)| {
            let out = lua.create_table()?;
            let n = a.raw_len().min(b.raw_len());
            for i in 1..=n {
                let pair = lua.create_sequence_from([
                    a.raw_get::<Value>(i)?,
                    b.raw_get::<Value>(i)?,
                ])?;
                out.raw_set(i, pair)?;
            }
            Ok(out)
        }),
        Native::JsonEncode => lua.create_function(|lua, value: Value| {
            let json: serde_json::Value = lua.from_value(value)?;
            serde_json::to_string(&json).map_err(mlua::Error::external)
        }),
        Native::JsonDecode => lua.create_function(|lua, text: mlua::String| {
            let json: serde_json::Value = serde_json::from_slice(&text.as_bytes())
                .map_err(|e| mlua::Error::RuntimeError(format!("json.decode: {e}")))?;
            lua.to_value(&json)
        }),
        Native::TimeTime => lua.create_function(|_, ()| {
            Ok(Utc::now().timestamp_micros() as f64 / 1_000_000.0)
        }),
        Native::TimeClock => {
            let started = env.started;
            lua.create_function(move |_, ()| Ok(started.elapsed().as_secs_f64()))
        }
        Native::TimeSleep => lua.create_function(move |_, seconds: f64| {
            if seconds < 0.0 {
                return Err(type_error("sleep() length must be non-negative"));
            }
            let length = Duration::try_from_secs_f64(seconds)
                .map_err(|e| type_error(format!("sleep() length: {e}")))?;
            // `None`: the length overflows the clock, so only cancellation
            // ends the sleep.
            let deadline = Instant::now().checked_add(length);
            loop {
                check_cancel(&ctx)?;
                let slice = match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return Ok(());
                        }
                        SLEEP_SLICE.min(deadline - now)
                    }
                    None => SLEEP_SLICE,
                };
                std::thread::sleep(slice);
            }
        }),
        Native::DatetimeNow => lua.create_function(|_, ()| Ok(Utc::now().to_rfc3339())),
        Native::DatetimeToday => {
            lua.create_function(|_, ()| Ok(Utc::now().format("%Y-%m-%d").to_string()))
        }
        Native::RandomRandom => {
            let rng = Arc::clone(&env.rng);
            lua.create_function(move |_, ()| Ok(lock(&rng).random::<f64>()))
        }
        Native::RandomRandint => {
            let rng = Arc::clone(&env.rng);
            lua.create_function(move |_, (a, b): (i64, i64)| {
                if a > b {
                    return Err(type_error(format!("randint() empty range [{a}, {b}]")));
                }
                Ok(lock(&rng).random_range(a..=b))
            })
        }
        Native::RandomUniform => {
            let rng = Arc::clone(&env.rng);
            lua.create_function(move |_, (a, b): (f64, f64)| {
                Ok(a + (b - a) * lock(&rng).random::<f64>())
            })
        }
        Native::RandomChoice => {
            let rng = Arc::clone(&env.rng);
            lua.create_function(move |_, t: Table| {
                let n = t.raw_len();
                if n == 0 {
                    return Err(mlua::Error::RuntimeError(
                        "choice() from an empty sequence".to_string(),
                    ));
                }
                let index = lock(&rng).random_range(1..=n);
                t.raw_get::<Value>(index)
            })
        }
        Native::RandomShuffle => {
            let rng = Arc::clone(&env.rng);
            lua.create_function(move |_, t: Table| {
                let mut values = t
                    .sequence_values::<Value>()
                    .collect::<mlua::Result<Vec<_>>>()?;
                values.shuffle(&mut *lock(&rng));
                for (i, value) in values.into_iter().enumerate() {
                    t.raw_set(i + 1, value)?;
                }
                Ok(())
            })
        }
        Native::RandomSeed => {
            let rng = Arc::clone(&env.rng);
            lua.create_function(move |_, seed: i64| {
                *lock(&rng) = StdRng::seed_from_u64(seed as u64);
                Ok(())
            })
        }
    }
}

/// Render arguments like `print` and push them to the session sink.
fn emit(lua: &Lua, ctx: &WorkerContext, stream: StreamKind, args: MultiValue) -> mlua::Result<()> {
    let tostring: Function = lua.globals().raw_get("tostring")?;
    let mut parts = Vec::with_capacity(args.len());
    for value in args {
        // Lua strings are byte strings; chunks carry text.
        let rendered = tostring.call::<mlua::String>(value)?;
        parts.push(rendered.to_string_lossy().to_string());
    }
    let mut line = parts.join("\t");
    line.push('\n');

    match ctx.sink.write(stream, line) {
        Ok(()) | Err(SinkError::Disconnected) => Ok(()),
        Err(SinkError::LimitExceeded { limit }) => Err(ScriptAbort::OutputLimit { limit }.into_lua()),
        Err(SinkError::Cancelled) | Err(SinkError::Closed) => {
            Err(ScriptAbort::Interrupted.into_lua())
        }
    }
}
