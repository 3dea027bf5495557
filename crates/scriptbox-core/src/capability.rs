//! Capability registry: the fixed allow-list of symbols and modules that
//! script text may resolve.
//!
//! The registry is pure data. It names *what* a script may reach; the
//! executing runtime decides *how* each entry is materialized. Nothing here
//! holds interpreter state, so one registry is built at startup and shared
//! read-only across every session.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Engine-provided functions, implemented by the runtime rather than
/// copied from the host interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Native {
    Print,
    Eprint,
    Require,
    Pcall,
    SetMetatable,
    Len,
    Range,
    Sorted,
    Sum,
    Keys,
    Set,
    Map,
    Filter,
    Zip,
    JsonEncode,
    JsonDecode,
    TimeTime,
    TimeClock,
    TimeSleep,
    DatetimeNow,
    DatetimeToday,
    RandomRandom,
    RandomRandint,
    RandomUniform,
    RandomChoice,
    RandomShuffle,
    RandomSeed,
}

/// How a global symbol is provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// Re-export of a host base-library global under the same semantics.
    Base(&'static str),
    /// Alias of one member of a host standard library.
    Library {
        library: &'static str,
        member: &'static str,
    },
    /// Engine-provided function.
    Native(Native),
}

/// Where a module's members come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleSource {
    /// A filtered view of a host standard library.
    Stdlib {
        library: &'static str,
        members: &'static [&'static str],
    },
    /// A module built entirely from engine-provided functions.
    Native(&'static [(&'static str, Native)]),
}

/// A restricted module as seen by script text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleFacade {
    pub name: &'static str,
    pub source: ModuleSource,
}

impl ModuleFacade {
    pub fn member_names(&self) -> Vec<&'static str> {
        match self.source {
            ModuleSource::Stdlib { members, .. } => members.to_vec(),
            ModuleSource::Native(members) => members.iter().map(|(name, _)| *name).collect(),
        }
    }
}

/// Result of a successful [`CapabilityRegistry::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability<'a> {
    Symbol(&'a Builtin),
    Module(&'a ModuleFacade),
}

/// Serializable description of a registry, for collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityManifest {
    pub symbols: Vec<String>,
    pub modules: BTreeMap<String, Vec<String>>,
    pub denied: BTreeMap<String, String>,
}

const BASE_SYMBOLS: &[&str] = &[
    "tostring",
    "tonumber",
    "type",
    "pairs",
    "ipairs",
    "next",
    "select",
    "error",
    "assert",
    "rawequal",
    "rawlen",
    "rawget",
    "rawset",
    "getmetatable",
];

const NATIVE_SYMBOLS: &[(&str, Native)] = &[
    ("print", Native::Print),
    ("eprint", Native::Eprint),
    ("require", Native::Require),
    ("pcall", Native::Pcall),
    ("setmetatable", Native::SetMetatable),
    ("len", Native::Len),
    ("range", Native::Range),
    ("sorted", Native::Sorted),
    ("sum", Native::Sum),
    ("keys", Native::Keys),
    ("set", Native::Set),
    ("map", Native::Map),
    ("filter", Native::Filter),
    ("zip", Native::Zip),
];

const LIBRARY_ALIASES: &[(&str, &str, &str)] = &[
    ("str", "_G", "tostring"),
    ("abs", "math", "abs"),
    ("min", "math", "min"),
    ("max", "math", "max"),
    ("unpack", "table", "unpack"),
];

const MATH_MEMBERS: &[&str] = &[
    "abs",
    "acos",
    "asin",
    "atan",
    "ceil",
    "cos",
    "deg",
    "exp",
    "floor",
    "fmod",
    "huge",
    "log",
    "max",
    "maxinteger",
    "min",
    "mininteger",
    "modf",
    "pi",
    "rad",
    "random",
    "randomseed",
    "sin",
    "sqrt",
    "tan",
    "tointeger",
    "type",
    "ult",
];

const STRING_MEMBERS: &[&str] = &[
    "byte", "char", "find", "format", "gmatch", "gsub", "len", "lower", "match", "rep",
    "reverse", "sub", "upper",
];

const TABLE_MEMBERS: &[&str] = &["concat", "insert", "move", "pack", "remove", "sort", "unpack"];

const UTF8_MEMBERS: &[&str] = &["char", "charpattern", "codepoint", "codes", "len", "offset"];

const RANDOM_MEMBERS: &[(&str, Native)] = &[
    ("random", Native::RandomRandom),
    ("randint", Native::RandomRandint),
    ("uniform", Native::RandomUniform),
    ("choice", Native::RandomChoice),
    ("shuffle", Native::RandomShuffle),
    ("seed", Native::RandomSeed),
];

const TIME_MEMBERS: &[(&str, Native)] = &[
    ("time", Native::TimeTime),
    ("clock", Native::TimeClock),
    ("sleep", Native::TimeSleep),
];

const DATETIME_MEMBERS: &[(&str, Native)] = &[
    ("now", Native::DatetimeNow),
    ("today", Native::DatetimeToday),
];

const JSON_MEMBERS: &[(&str, Native)] = &[
    ("encode", Native::JsonEncode),
    ("decode", Native::JsonDecode),
];

const DENIED: &[(&str, &str)] = &[
    ("os", "process and environment access"),
    ("io", "file system access"),
    ("debug", "reflection into the interpreter"),
    ("package", "module loader access"),
    ("load", "dynamic code loading"),
    ("loadstring", "dynamic code loading"),
    ("loadfile", "file system code loading"),
    ("dofile", "file system code loading"),
    ("collectgarbage", "interpreter memory control"),
    ("_G", "unrestricted global namespace"),
    ("coroutine", "unsupervised control flow"),
    ("getfenv", "environment reflection"),
    ("setfenv", "environment mutation"),
    ("module", "global namespace mutation"),
];

/// The immutable allow-list consulted by the runtime when it builds a
/// script's environment.
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    symbols: BTreeMap<&'static str, Builtin>,
    modules: BTreeMap<&'static str, ModuleFacade>,
    denied: BTreeMap<&'static str, &'static str>,
}

impl CapabilityRegistry {
    /// The standard registry used by every session.
    pub fn standard() -> Self {
        let mut symbols = BTreeMap::new();
        for &name in BASE_SYMBOLS {
            symbols.insert(name, Builtin::Base(name));
        }
        for &(name, library, member) in LIBRARY_ALIASES {
            symbols.insert(name, Builtin::Library { library, member });
        }
        for &(name, native) in NATIVE_SYMBOLS {
            symbols.insert(name, Builtin::Native(native));
        }

        let modules = [
            ModuleFacade {
                name: "math",
                source: ModuleSource::Stdlib {
                    library: "math",
                    members: MATH_MEMBERS,
                },
            },
            ModuleFacade {
                name: "string",
                source: ModuleSource::Stdlib {
                    library: "string",
                    members: STRING_MEMBERS,
                },
            },
            ModuleFacade {
                name: "table",
                source: ModuleSource::Stdlib {
                    library: "table",
                    members: TABLE_MEMBERS,
                },
            },
            ModuleFacade {
                name: "utf8",
                source: ModuleSource::Stdlib {
                    library: "utf8",
                    members: UTF8_MEMBERS,
                },
            },
            ModuleFacade {
                name: "random",
                source: ModuleSource::Native(RANDOM_MEMBERS),
            },
            ModuleFacade {
                name: "time",
                source: ModuleSource::Native(TIME_MEMBERS),
            },
            ModuleFacade {
                name: "datetime",
                source: ModuleSource::Native(DATETIME_MEMBERS),
            },
            ModuleFacade {
                name: "json",
                source: ModuleSource::Native(JSON_MEMBERS),
            },
        ]
        .into_iter()
        .map(|m| (m.name, m))
        .collect();

        Self {
            symbols,
            modules,
            denied: DENIED.iter().copied().collect(),
        }
    }

    /// Resolve a global name. Symbols shadow modules of the same name.
    pub fn resolve(&self, name: &str) -> Option<Capability<'_>> {
        if let Some(builtin) = self.symbols.get(name) {
            return Some(Capability::Symbol(builtin));
        }
        self.modules.get(name).map(Capability::Module)
    }

    pub fn module(&self, name: &str) -> Option<&ModuleFacade> {
        self.modules.get(name)
    }

    /// Audit reason when `name` is a known sandbox-escape target.
    pub fn denial(&self, name: &str) -> Option<&'static str> {
        self.denied.get(name).copied()
    }

    pub fn symbols(&self) -> impl Iterator<Item = (&'static str, &Builtin)> {
        self.symbols.iter().map(|(name, b)| (*name, b))
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleFacade> {
        self.modules.values()
    }

    pub fn manifest(&self) -> CapabilityManifest {
        CapabilityManifest {
            symbols: self.symbols.keys().map(|s| s.to_string()).collect(),
            modules: self
                .modules
                .values()
                .map(|m| {
                    let mut members: Vec<String> =
                        m.member_names().into_iter().map(String::from).collect();
                    members.sort();
                    (m.name.to_string(), members)
                })
                .collect(),
            denied: self
                .denied
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_base_and_native_symbols() {
        let reg = CapabilityRegistry::standard();
        assert_eq!(
            reg.resolve("tostring"),
            Some(Capability::Symbol(&Builtin::Base("tostring")))
        );
        assert_eq!(
            reg.resolve("print"),
            Some(Capability::Symbol(&Builtin::Native(Native::Print)))
        );
        assert!(matches!(
            reg.resolve("abs"),
            Some(Capability::Symbol(Builtin::Library {
                library: "math",
                member: "abs"
            }))
        ));
    }

    #[test]
    fn test_resolves_modules() {
        let reg = CapabilityRegistry::standard();
        for name in ["math", "string", "table", "utf8", "random", "time", "datetime", "json"] {
            assert!(
                matches!(reg.resolve(name), Some(Capability::Module(m)) if m.name == name),
                "module {name} should resolve"
            );
        }
    }

    #[test]
    fn test_denied_names_never_resolve() {
        let reg = CapabilityRegistry::standard();
        for name in ["os", "io", "debug", "package", "load", "dofile", "_G", "coroutine"] {
            assert!(reg.resolve(name).is_none(), "{name} must not resolve");
            assert!(reg.denial(name).is_some(), "{name} must be audited");
        }
    }

    #[test]
    fn test_unknown_names_are_neither_allowed_nor_denied() {
        let reg = CapabilityRegistry::standard();
        assert!(reg.resolve("socket").is_none());
        assert!(reg.denial("socket").is_none());
    }

    #[test]
    fn test_string_facade_excludes_dump() {
        let reg = CapabilityRegistry::standard();
        let string = reg.module("string").unwrap();
        let members = string.member_names();
        assert!(members.contains(&"format"));
        assert!(!members.contains(&"dump"));
    }

    #[test]
    fn test_construction_is_deterministic() {
        let a = CapabilityRegistry::standard().manifest();
        let b = CapabilityRegistry::standard().manifest();
        assert_eq!(a, b);
    }

    #[test]
    fn test_manifest_serializes() {
        let manifest = CapabilityRegistry::standard().manifest();
        let json = serde_json::to_value(&manifest).unwrap();
        assert!(json["symbols"]
            .as_array()
            .unwrap()
            .iter()
            .any(|s| s == "print"));
        assert_eq!(json["modules"]["json"], serde_json::json!(["decode", "encode"]));
        assert!(json["denied"]["os"].is_string());
    }
}
