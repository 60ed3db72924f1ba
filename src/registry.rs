//! Kitten dispatch: the prewarmed command table.
//!
//! The supervisor builds this table once at startup, before any fork; forked
//! children inherit it and tail-call [`Registry::dispatch`] after their
//! readiness gate opens. This is the compiled-world replacement for the
//! interpreter trick of importing every kitten module up front.

use crate::config::Options;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::Duration;

/// Everything a kitten sees when invoked.
pub struct Invocation<'a> {
    /// argv as supplied in the fork request; argv[0] selects the kitten.
    pub argv: &'a [String],
    pub stdin: &'a mut dyn Read,
    pub stdout: &'a mut dyn Write,
    pub options: &'a Options,
}

pub type KittenHandler = fn(&mut Invocation<'_>) -> Result<i32>;

pub struct Registry {
    handlers: HashMap<&'static str, KittenHandler>,
}

impl Registry {
    /// Register every kitten handler. Called once, before any fork.
    pub fn prewarmed() -> Self {
        let mut handlers: HashMap<&'static str, KittenHandler> = HashMap::new();
        handlers.insert("echo", kitten_echo);
        handlers.insert("env", kitten_env);
        handlers.insert("pwd", kitten_pwd);
        handlers.insert("config", kitten_config);
        handlers.insert("save", kitten_save);
        handlers.insert("sleep", kitten_sleep);
        Self { handlers }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Run argv[0] as a kitten and return its exit code.
    pub fn dispatch(&self, invocation: &mut Invocation<'_>) -> Result<i32> {
        let name = invocation.argv.first().map(String::as_str).unwrap_or("");
        match self.handlers.get(name) {
            Some(handler) => handler(invocation),
            None => {
                eprintln!("[dispatch] Unknown kitten: {name:?}");
                Ok(1)
            }
        }
    }
}

// =============================================================================
// Built-in kittens
// =============================================================================

/// echo: write the arguments, then everything on stdin, back out.
fn kitten_echo(invocation: &mut Invocation<'_>) -> Result<i32> {
    let args = invocation.argv[1..].join(" ");
    if !args.is_empty() {
        writeln!(invocation.stdout, "{args}")?;
    }
    let mut data = Vec::new();
    invocation.stdin.read_to_end(&mut data)?;
    invocation.stdout.write_all(&data)?;
    invocation.stdout.flush()?;
    Ok(0)
}

/// env: print the process environment, sorted, one VAR=value per line.
fn kitten_env(invocation: &mut Invocation<'_>) -> Result<i32> {
    let mut vars: Vec<(String, String)> = std::env::vars().collect();
    vars.sort();
    for (key, value) in vars {
        writeln!(invocation.stdout, "{key}={value}")?;
    }
    invocation.stdout.flush()?;
    Ok(0)
}

/// pwd: print the working directory.
fn kitten_pwd(invocation: &mut Invocation<'_>) -> Result<i32> {
    writeln!(
        invocation.stdout,
        "{}",
        std::env::current_dir()?.display()
    )?;
    invocation.stdout.flush()?;
    Ok(0)
}

/// config: dump the active options snapshot as JSON.
fn kitten_config(invocation: &mut Invocation<'_>) -> Result<i32> {
    writeln!(
        invocation.stdout,
        "{}",
        serde_json::to_string(invocation.options)?
    )?;
    invocation.stdout.flush()?;
    Ok(0)
}

/// save: copy stdin into the file named by the first argument.
fn kitten_save(invocation: &mut Invocation<'_>) -> Result<i32> {
    let path = invocation
        .argv
        .get(1)
        .context("save: missing target path")?;
    let mut data = Vec::new();
    invocation.stdin.read_to_end(&mut data)?;
    std::fs::write(path, &data).with_context(|| format!("save: write {path}"))?;
    Ok(0)
}

/// sleep: park for the given number of seconds.
fn kitten_sleep(invocation: &mut Invocation<'_>) -> Result<i32> {
    let seconds = match invocation.argv.get(1) {
        Some(raw) => raw
            .parse::<f64>()
            .with_context(|| format!("sleep: bad duration {raw:?}"))?,
        None => 1.0,
    };
    std::thread::sleep(Duration::from_secs_f64(seconds));
    Ok(0)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn run(argv: &[&str], stdin: &[u8]) -> (i32, Vec<u8>) {
        let registry = Registry::prewarmed();
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        let options = Options::default();
        let mut input = Cursor::new(stdin.to_vec());
        let mut output = Vec::new();
        let code = {
            let mut invocation = Invocation {
                argv: &argv,
                stdin: &mut input,
                stdout: &mut output,
                options: &options,
            };
            registry.dispatch(&mut invocation).unwrap()
        };
        (code, output)
    }

    #[test]
    fn test_registry_is_populated() {
        let registry = Registry::prewarmed();
        assert!(registry.contains("echo"));
        assert!(registry.contains("config"));
        assert!(!registry.contains("icat"));
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_echo_args_and_stdin() {
        let (code, out) = run(&["echo", "a", "b"], b"from stdin");
        assert_eq!(code, 0);
        assert_eq!(out, b"a b\nfrom stdin");
    }

    #[test]
    fn test_echo_stdin_only() {
        let (code, out) = run(&["echo"], b"hello");
        assert_eq!(code, 0);
        assert_eq!(out, b"hello");
    }

    #[test]
    fn test_unknown_kitten_exits_nonzero() {
        let (code, out) = run(&["no-such-kitten"], b"");
        assert_eq!(code, 1);
        assert!(out.is_empty());
    }

    #[test]
    fn test_empty_argv_exits_nonzero() {
        let (code, _) = run(&[], b"");
        assert_eq!(code, 1);
    }

    #[test]
    fn test_pwd_prints_current_dir() {
        let (code, out) = run(&["pwd"], b"");
        assert_eq!(code, 0);
        let line = String::from_utf8(out).unwrap();
        assert_eq!(
            line.trim_end(),
            std::env::current_dir().unwrap().display().to_string()
        );
    }

    #[test]
    fn test_save_writes_stdin_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        let registry = Registry::prewarmed();
        let argv = vec!["save".to_string(), path.display().to_string()];
        let options = Options::default();
        let mut input = Cursor::new(b"exact bytes".to_vec());
        let mut output = Vec::new();
        let mut invocation = Invocation {
            argv: &argv,
            stdin: &mut input,
            stdout: &mut output,
            options: &options,
        };
        assert_eq!(registry.dispatch(&mut invocation).unwrap(), 0);
        assert_eq!(std::fs::read(&path).unwrap(), b"exact bytes");
    }

    #[test]
    fn test_config_reports_options() {
        let registry = Registry::prewarmed();
        let argv = vec!["config".to_string()];
        let options = Options {
            config_paths: vec!["/tmp/kitty.conf".to_string()],
            overrides: Default::default(),
        };
        let mut input = Cursor::new(Vec::new());
        let mut output = Vec::new();
        let mut invocation = Invocation {
            argv: &argv,
            stdin: &mut input,
            stdout: &mut output,
            options: &options,
        };
        assert_eq!(registry.dispatch(&mut invocation).unwrap(), 0);
        assert!(String::from_utf8(output).unwrap().contains("/tmp/kitty.conf"));
    }
}
