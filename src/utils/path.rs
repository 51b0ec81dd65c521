/// Path and file helpers.
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use once_cell::sync::Lazy;
use regex::Regex;

static ENV_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .expect("env var pattern")
});

/// Expand `~` and `$VAR`/`${VAR}`, then make the path absolute.
///
/// Unknown variables are left as written.
pub fn normalize_path(path: impl AsRef<Path>) -> PathBuf {
    let raw = path.as_ref().to_string_lossy().into_owned();
    let expanded = ENV_VAR.replace_all(&raw, |caps: &regex::Captures| {
        let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
        std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
    });

    let expanded = match expanded.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match dirs::home_dir() {
            Some(home) => home.join(rest.trim_start_matches('/')),
            None => PathBuf::from(expanded.as_ref()),
        },
        _ => PathBuf::from(expanded.as_ref()),
    };

    if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&expanded))
            .unwrap_or(expanded)
    }
}

/// First match of `pattern` in a text file.
///
/// Returns capture group 1 when the pattern has one, else the whole match.
pub fn find_in_file(path: impl AsRef<Path>, pattern: &Regex) -> Option<String> {
    let file = File::open(path.as_ref()).ok()?;
    BufReader::new(file)
        .lines()
        .map_while(|line| line.ok())
        .find_map(|line| {
            pattern.captures(&line).map(|caps| {
                caps.get(1)
                    .or_else(|| caps.get(0))
                    .map_or(String::new(), |m| m.as_str().to_string())
            })
        })
}

/// Make a test name safe to use as a file name.
pub fn sanitize_test_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_normalize_expands_env_and_home() {
        std::env::set_var("TWISTER_TEST_DIR", "/opt/zephyr");
        assert_eq!(
            normalize_path("$TWISTER_TEST_DIR/build"),
            PathBuf::from("/opt/zephyr/build")
        );
        assert_eq!(
            normalize_path("${TWISTER_TEST_DIR}/x"),
            PathBuf::from("/opt/zephyr/x")
        );
        assert_eq!(
            normalize_path("/a/$TWISTER_SURELY_UNSET_VAR"),
            PathBuf::from("/a/$TWISTER_SURELY_UNSET_VAR")
        );
        if let Some(home) = dirs::home_dir() {
            assert_eq!(normalize_path("~/build"), home.join("build"));
        }
        assert!(normalize_path("relative").is_absolute());
    }

    #[test]
    fn test_find_in_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "CMAKE_BUILD_TYPE:STRING=").unwrap();
        writeln!(file, "CMAKE_GENERATOR:INTERNAL=Ninja").unwrap();

        let generator = Regex::new(r"^CMAKE_GENERATOR:INTERNAL=(.*)$").unwrap();
        assert_eq!(find_in_file(file.path(), &generator), Some("Ninja".to_string()));

        let whole = Regex::new(r"BUILD_TYPE").unwrap();
        assert_eq!(find_in_file(file.path(), &whole), Some("BUILD_TYPE".to_string()));

        assert_eq!(find_in_file("/nonexistent/CMakeCache.txt", &generator), None);
    }

    #[test]
    fn test_sanitize_test_name() {
        assert_eq!(
            sanitize_test_name("test_shell[help-Available commands]"),
            "test_shell_help-Available_commands_"
        );
    }
}
