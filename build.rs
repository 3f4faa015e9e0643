use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Source trees checked by the policy scans. The read-only reference material next
// to the crate is deliberately not walked.
const SOURCE_ROOTS: [&str; 4] = ["lasso", "cli", "tests", "benches"];

// The one engine file allowed to touch the filesystem.
const EXPORT_FILE: &str = "lasso/export.rs";

// A policy rule: a line regex plus the explanation printed when it matches.
struct Rule {
    name: &'static str,
    pattern: &'static str,
    advice: &'static str,
    // Restricts the rule to files under this directory.
    only_under: Option<&'static str>,
    // Files exempt from this rule.
    exempt: &'static [&'static str],
    skip_comments: bool,
}

const RULES: [Rule; 5] = [
    Rule {
        name: "underscore-prefixed variables",
        pattern: r"\b(_[a-zA-Z0-9_]+)\b",
        advice: "Either use the variable (removing the underscore) or bind it to `_`.",
        only_under: None,
        exempt: &[],
        skip_comments: true,
    },
    Rule {
        name: "#[allow(dead_code)] attributes",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        advice: "Either use the code (removing the attribute) or remove it completely.",
        only_under: None,
        exempt: &[],
        skip_comments: false,
    },
    Rule {
        name: "forbidden comment words",
        pattern: r"(//|/\*).*(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|UPDATED|UPDATE)",
        advice: "Comments describe the code, not its history. Remove the word.",
        only_under: None,
        exempt: &[],
        skip_comments: false,
    },
    Rule {
        name: "console output in the library",
        pattern: r"\b(println|eprintln|print|eprint|dbg)!",
        advice: "The library reports through the `log` facade; only the CLI prints.",
        only_under: Some("lasso"),
        exempt: &[],
        skip_comments: true,
    },
    Rule {
        name: "filesystem access in the engine",
        pattern: r"\bstd::fs\b|\bfs::",
        advice: "Solving is free of I/O; persistence belongs in lasso/export.rs.",
        only_under: Some("lasso"),
        exempt: &[EXPORT_FILE],
        skip_comments: true,
    },
];

// A custom "Sink" for the grep searcher. It collects all matching lines of one
// file for one rule so the error lists every offending line at once.
struct ViolationCollector<'r> {
    rule: &'r Rule,
    violations: Vec<String>,
    file_path: PathBuf,
}

impl<'r> ViolationCollector<'r> {
    fn new(rule: &'r Rule, file_path: &Path) -> Self {
        Self {
            rule,
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
        }
    }

    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.name,
            file_name
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", self.rule.advice));
        Some(error_msg)
    }
}

// Matches inside comments or string literals are not code and are skipped for
// rules that ask for it.
fn is_comment_or_string(line_text: &str) -> bool {
    let trimmed = line_text.trim_start();
    if trimmed.starts_with("//") {
        return true;
    }
    if line_text.contains('"') {
        let parts: Vec<&str> = line_text.split('"').collect();
        return parts
            .iter()
            .enumerate()
            .any(|(i, part)| i % 2 == 1 && part.contains('_'));
    }
    false
}

impl Sink for ViolationCollector<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        if self.rule.skip_comments && is_comment_or_string(line_text) {
            return Ok(true);
        }

        self.violations.push(format!("{line_number}:{line_text}"));
        Ok(true)
    }
}

fn rust_sources() -> Vec<PathBuf> {
    SOURCE_ROOTS
        .iter()
        .filter(|root| Path::new(root).exists())
        .flat_map(|root| {
            WalkDir::new(root)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
                .map(|e| e.path().to_path_buf())
                .collect::<Vec<_>>()
        })
        .collect()
}

fn applies(rule: &Rule, path: &Path) -> bool {
    let under = rule.only_under.is_none_or(|dir| path.starts_with(dir));
    let exempt = rule.exempt.iter().any(|file| path == Path::new(file));
    under && !exempt
}

fn scan_sources() -> Result<(), Box<dyn Error>> {
    let mut searcher = Searcher::new();
    let sources = rust_sources();
    for rule in &RULES {
        let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
        for path in sources.iter().filter(|path| applies(rule, path)) {
            let mut collector = ViolationCollector::new(rule, path);
            searcher.search_path(&matcher, path, &mut collector)?;
            if let Some(error_message) = collector.check_and_get_error_message() {
                return Err(error_message.into());
            }
        }
    }
    Ok(())
}

fn main() {
    // Always rerun this script if the build script itself changes.
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    // The `eprintln!` here is what shows the violation in `cargo`'s output.
    if let Err(e) = scan_sources() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
