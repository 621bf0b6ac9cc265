//! Recipe DSL parser.
//!
//! Hand-written recursive descent over the in-memory file text. The DSL is
//! authored configuration, not untrusted input: any violation aborts the
//! whole run with a located message and there is no recovery.
//!
//! ```text
//! @import targets/*.chariot
//!
//! source/binutils {
//!     type: tar.xz
//!     url: https://ftp.gnu.org/gnu/binutils/binutils-2.42.tar.xz
//!     b2sum: f6e4d32...
//!     dependencies: [ image/xz ]
//! }
//!
//! host/binutils {
//!     source: binutils
//!     configure: { @(source_dir)/configure --prefix=@(prefix) }
//!     build: { make -j@(thread_count) }
//!     install: { make DESTDIR=@(install_dir) install }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use thiserror::Error;

use crate::recipe::{
    BuildPayload, Config, Dependency, ImageDependency, Namespace, Payload, Recipe, SourceKind,
    SourcePayload, SourceRef,
};

/// A configuration error with its location. Formatting matches compiler
/// convention so editors can jump to it.
#[derive(Debug, Error)]
#[error("{file}:{line}:{col}: {msg}")]
pub struct ParseError {
    pub file: PathBuf,
    pub line: usize,
    pub col: usize,
    pub msg: String,
}

/// Parse the configuration rooted at `path`, following `@import` directives
/// (glob patterns allowed, resolved relative to the importing file).
pub fn parse_config(path: &Path) -> Result<Config> {
    let mut parser = Parser {
        config: Config::new(),
        visiting: Vec::new(),
    };
    parser.parse_file(path)?;
    Ok(parser.config)
}

/// Load `.chariot-overrides` from the config directory: one
/// `<source-name>: <local-path>` pair per line, `#` comments and blank
/// lines ignored. Relative paths are taken relative to the config directory.
pub fn load_overrides(config_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let path = config_dir.join(".chariot-overrides");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let mut overrides = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            bail!(
                "{}:{}: expected '<source-name>: <local-path>'",
                path.display(),
                lineno + 1
            );
        };
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() || value.is_empty() {
            bail!(
                "{}:{}: expected '<source-name>: <local-path>'",
                path.display(),
                lineno + 1
            );
        }
        let mut local = PathBuf::from(value);
        if local.is_relative() {
            local = config_dir.join(local);
        }
        overrides.push((name.to_string(), local));
    }
    Ok(overrides)
}

struct Parser {
    config: Config,
    /// Canonical paths of files currently being parsed, for circular
    /// `@import` detection.
    visiting: Vec<PathBuf>,
}

impl Parser {
    fn parse_file(&mut self, path: &Path) -> Result<()> {
        let canonical = path
            .canonicalize()
            .with_context(|| format!("Failed to open config {}", path.display()))?;
        if self.visiting.contains(&canonical) {
            bail!("circular @import of {}", path.display());
        }
        let text = fs::read_to_string(&canonical)
            .with_context(|| format!("Failed to read config {}", canonical.display()))?;

        self.visiting.push(canonical.clone());
        let result = self.parse_text(&canonical, &text);
        self.visiting.pop();
        result
    }

    fn parse_text(&mut self, file: &Path, text: &str) -> Result<()> {
        let mut cur = Cursor::new(file, text);
        loop {
            cur.skip_trivia()?;
            match cur.peek() {
                None => return Ok(()),
                Some(b'@') => {
                    cur.bump();
                    let directive = cur.ident()?;
                    if directive != "import" {
                        return Err(cur.fail(format!("unknown directive @{directive}")).into());
                    }
                    cur.skip_inline_ws();
                    let pattern = if cur.peek() == Some(b'"') {
                        cur.string()?
                    } else {
                        cur.word()?
                    };
                    self.import(file, &pattern)?;
                }
                Some(_) => {
                    let recipe = parse_recipe(&mut cur)?;
                    if let Err(msg) = self.config.push(recipe) {
                        return Err(cur.fail(msg).into());
                    }
                }
            }
        }
    }

    fn import(&mut self, importer: &Path, pattern: &str) -> Result<()> {
        let base = importer.parent().unwrap_or(Path::new("."));
        let full = base.join(pattern);
        let full = full.to_string_lossy();

        let entries = glob::glob(&full)
            .with_context(|| format!("Bad @import pattern {pattern}"))?;
        let mut paths: Vec<PathBuf> = entries
            .collect::<std::result::Result<_, _>>()
            .with_context(|| format!("Failed to expand @import {pattern}"))?;
        if paths.is_empty() {
            bail!("@import {} matched no files (from {})", pattern, importer.display());
        }
        paths.sort();
        for path in paths {
            self.parse_file(&path)?;
        }
        Ok(())
    }
}

/// One parsed `key: value` entry inside a recipe body.
enum Value {
    Scalar(String),
    Block(String),
    Deps(Vec<Dependency>, Vec<ImageDependency>),
}

fn parse_recipe(cur: &mut Cursor) -> Result<Recipe> {
    let (line, col) = (cur.line, cur.col);
    let ns_word = cur.ident()?;
    let Some(namespace) = Namespace::parse(&ns_word) else {
        return Err(cur
            .fail_at(line, col, format!("unknown namespace `{ns_word}`"))
            .into());
    };
    cur.expect(b'/')?;
    let name = cur.ident()?;
    cur.skip_trivia()?;
    cur.expect(b'{')?;

    // Collected fields; validated for the namespace once the body closes.
    let mut kind: Option<SourceKind> = None;
    let mut url: Option<String> = None;
    let mut patch: Option<String> = None;
    let mut b2sum: Option<String> = None;
    let mut commit: Option<String> = None;
    let mut strap: Option<String> = None;
    let mut source: Option<SourceRef> = None;
    let mut configure: Option<String> = None;
    let mut build: Option<String> = None;
    let mut install: Option<String> = None;
    let mut dependencies: Vec<Dependency> = Vec::new();
    let mut image_dependencies: Vec<ImageDependency> = Vec::new();

    loop {
        cur.skip_trivia()?;
        // Entries may be separated by commas in single-line bodies.
        while cur.peek() == Some(b',') {
            cur.bump();
            cur.skip_trivia()?;
        }
        if cur.peek() == Some(b'}') {
            cur.bump();
            break;
        }
        let (kline, kcol) = (cur.line, cur.col);
        let key = cur.ident()?;
        cur.skip_trivia()?;
        cur.expect(b':')?;
        cur.skip_inline_ws();
        let value = parse_value(cur)?;

        let dup = |cur: &Cursor| cur.fail_at(kline, kcol, format!("duplicate key `{key}`"));
        let expect_scalar = |v: Value, cur: &Cursor| match v {
            Value::Scalar(s) => Ok(s),
            _ => Err(cur.fail_at(kline, kcol, format!("`{key}` expects a value, not a block or list"))),
        };
        let expect_block = |v: Value, cur: &Cursor| match v {
            Value::Block(s) => Ok(s),
            _ => Err(cur.fail_at(kline, kcol, format!("`{key}` expects a {{ code block }}"))),
        };

        match (namespace, key.as_str()) {
            (Namespace::Source, "type") => {
                let s = expect_scalar(value, cur)?;
                let Some(k) = SourceKind::parse(&s) else {
                    return Err(cur.fail_at(kline, kcol, format!("unknown source type `{s}`")).into());
                };
                if kind.replace(k).is_some() {
                    return Err(dup(cur).into());
                }
            }
            (Namespace::Source, "url") => {
                if url.replace(expect_scalar(value, cur)?).is_some() {
                    return Err(dup(cur).into());
                }
            }
            (Namespace::Source, "patch") => {
                if patch.replace(expect_scalar(value, cur)?).is_some() {
                    return Err(dup(cur).into());
                }
            }
            (Namespace::Source, "b2sum") => {
                if b2sum.replace(expect_scalar(value, cur)?).is_some() {
                    return Err(dup(cur).into());
                }
            }
            (Namespace::Source, "commit") => {
                if commit.replace(expect_scalar(value, cur)?).is_some() {
                    return Err(dup(cur).into());
                }
            }
            (Namespace::Source, "strap") => {
                if strap.replace(expect_block(value, cur)?).is_some() {
                    return Err(dup(cur).into());
                }
            }
            (Namespace::Host | Namespace::Target, "source") => {
                let s = expect_scalar(value, cur)?;
                if source.replace(SourceRef { name: s, target: None }).is_some() {
                    return Err(dup(cur).into());
                }
            }
            (Namespace::Host | Namespace::Target, "configure") => {
                if configure.replace(expect_block(value, cur)?).is_some() {
                    return Err(dup(cur).into());
                }
            }
            (Namespace::Host | Namespace::Target, "build") => {
                if build.replace(expect_block(value, cur)?).is_some() {
                    return Err(dup(cur).into());
                }
            }
            (Namespace::Host | Namespace::Target, "install") => {
                if install.replace(expect_block(value, cur)?).is_some() {
                    return Err(dup(cur).into());
                }
            }
            (_, "dependencies") => match value {
                Value::Deps(deps, images) => {
                    if !dependencies.is_empty() || !image_dependencies.is_empty() {
                        return Err(dup(cur).into());
                    }
                    dependencies = deps;
                    image_dependencies = images;
                }
                _ => {
                    return Err(cur
                        .fail_at(kline, kcol, "`dependencies` expects [ a, list ]".to_string())
                        .into())
                }
            },
            _ => {
                return Err(cur
                    .fail_at(kline, kcol, format!("unknown key `{key}` in {ns_word} recipe"))
                    .into())
            }
        }
    }

    let label = format!("{namespace}/{name}");
    let payload = match namespace {
        Namespace::Source => {
            let Some(kind) = kind else {
                return Err(cur.fail(format!("{label}: missing `type`")).into());
            };
            let Some(url) = url else {
                return Err(cur.fail(format!("{label}: missing `url`")).into());
            };
            // Kind-specific field rules, enforced at parse.
            match kind {
                k if k.is_tar() => {
                    if b2sum.is_none() {
                        return Err(cur.fail(format!("{label}: tar sources require `b2sum`")).into());
                    }
                    if commit.is_some() {
                        return Err(cur.fail(format!("{label}: `commit` is only valid for git sources")).into());
                    }
                }
                SourceKind::Git => {
                    if commit.is_none() {
                        return Err(cur.fail(format!("{label}: git sources require `commit`")).into());
                    }
                    if b2sum.is_some() {
                        return Err(cur.fail(format!("{label}: `b2sum` is only valid for tar sources")).into());
                    }
                }
                _ => {
                    if b2sum.is_some() || commit.is_some() {
                        return Err(cur
                            .fail(format!("{label}: local sources take neither `b2sum` nor `commit`"))
                            .into());
                    }
                }
            }
            Payload::Source(SourcePayload { kind, url, patch, b2sum, commit, strap })
        }
        Namespace::Host | Namespace::Target => Payload::Build(BuildPayload {
            source,
            configure,
            build,
            install,
        }),
    };

    Ok(Recipe {
        namespace,
        name,
        dependencies,
        image_dependencies,
        payload,
    })
}

fn parse_value(cur: &mut Cursor) -> Result<Value> {
    match cur.peek() {
        Some(b'[') => parse_dep_list(cur),
        Some(b'{') => Ok(Value::Block(cur.code_block()?)),
        Some(b'"') => Ok(Value::Scalar(cur.string()?)),
        _ => Ok(Value::Scalar(cur.scalar()?)),
    }
}

fn parse_dep_list(cur: &mut Cursor) -> Result<Value> {
    cur.expect(b'[')?;
    let mut deps = Vec::new();
    let mut images = Vec::new();
    loop {
        cur.skip_trivia()?;
        match cur.peek() {
            Some(b']') => {
                cur.bump();
                break;
            }
            Some(b',') => {
                cur.bump();
            }
            Some(_) => {
                let runtime = if cur.peek() == Some(b'*') {
                    cur.bump();
                    true
                } else {
                    false
                };
                let (line, col) = (cur.line, cur.col);
                let prefix = cur.ident()?;
                cur.expect(b'/')?;
                let name = cur.ident()?;
                if prefix == "image" {
                    images.push(ImageDependency { package: name, runtime });
                } else if let Some(namespace) = Namespace::parse(&prefix) {
                    deps.push(Dependency { namespace, name, runtime, target: None });
                } else {
                    return Err(cur
                        .fail_at(line, col, format!("unknown dependency namespace `{prefix}`"))
                        .into());
                }
            }
            None => return Err(cur.fail("unterminated dependency list".to_string()).into()),
        }
    }
    Ok(Value::Deps(deps, images))
}

/// Byte cursor with line/column tracking. The DSL structure is ASCII; code
/// blocks and string contents pass through verbatim as UTF-8.
struct Cursor<'a> {
    file: &'a Path,
    src: &'a str,
    pos: usize,
    line: usize,
    col: usize,
}

impl<'a> Cursor<'a> {
    fn new(file: &'a Path, src: &'a str) -> Self {
        Self { file, src, pos: 0, line: 1, col: 1 }
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn peek_at(&self, off: usize) -> Option<u8> {
        self.src.as_bytes().get(self.pos + off).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(b)
    }

    fn fail(&self, msg: String) -> ParseError {
        self.fail_at(self.line, self.col, msg)
    }

    fn fail_at(&self, line: usize, col: usize, msg: String) -> ParseError {
        ParseError { file: self.file.to_path_buf(), line, col, msg }
    }

    /// Skip whitespace and both comment forms.
    fn skip_trivia(&mut self) -> Result<(), ParseError> {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while let Some(b) = self.peek() {
                        if b == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    let (line, col) = (self.line, self.col);
                    self.bump();
                    self.bump();
                    loop {
                        match self.peek() {
                            Some(b'*') if self.peek_at(1) == Some(b'/') => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            Some(_) => {
                                self.bump();
                            }
                            None => {
                                return Err(self.fail_at(line, col, "unterminated /* comment".into()))
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Skip spaces and tabs only, staying on the current line.
    fn skip_inline_ws(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t') | Some(b'\r')) {
            self.bump();
        }
    }

    fn expect(&mut self, want: u8) -> Result<(), ParseError> {
        match self.peek() {
            Some(b) if b == want => {
                self.bump();
                Ok(())
            }
            Some(b) => Err(self.fail(format!("expected `{}`, found `{}`", want as char, b as char))),
            None => Err(self.fail(format!("expected `{}`, found end of file", want as char))),
        }
    }

    /// ASCII letter, then letters/digits/`_`/`.`/`-`/`+`.
    fn ident(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            Some(b) if b.is_ascii_alphabetic() => {}
            Some(b) => return Err(self.fail(format!("expected identifier, found `{}`", b as char))),
            None => return Err(self.fail("expected identifier, found end of file".into())),
        }
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-' | b'+') {
                self.bump();
            } else {
                break;
            }
        }
        Ok(self.src[start..self.pos].to_string())
    }

    /// Double-quoted string; may not contain a newline.
    fn string(&mut self) -> Result<String, ParseError> {
        let (line, col) = (self.line, self.col);
        self.expect(b'"')?;
        let start = self.pos;
        loop {
            match self.peek() {
                Some(b'"') => {
                    let s = self.src[start..self.pos].to_string();
                    self.bump();
                    return Ok(s);
                }
                Some(b'\n') | None => {
                    return Err(self.fail_at(line, col, "unterminated string".into()))
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
    }

    /// A single non-whitespace word (used for `@import` paths).
    fn word(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_whitespace() {
                break;
            }
            self.bump();
        }
        if start == self.pos {
            return Err(self.fail("expected a path".into()));
        }
        Ok(self.src[start..self.pos].to_string())
    }

    /// Scalar value, trimmed: runs to end of line, or to the `,` or `}`
    /// that continues a single-line recipe body. Values containing those
    /// characters go in a quoted string. `//` is NOT treated as a comment
    /// here: URLs contain it.
    fn scalar(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if matches!(b, b'\n' | b',' | b'}') {
                break;
            }
            self.bump();
        }
        let raw = self.src[start..self.pos].trim();
        if raw.is_empty() {
            return Err(self.fail("expected a value before end of line".into()));
        }
        Ok(raw.to_string())
    }

    /// Balanced-brace code block, trimmed at both ends. The body is opaque
    /// text; braces are counted by depth.
    fn code_block(&mut self) -> Result<String, ParseError> {
        let (line, col) = (self.line, self.col);
        self.expect(b'{')?;
        let start = self.pos;
        let mut depth = 1usize;
        loop {
            match self.peek() {
                Some(b'{') => {
                    depth += 1;
                    self.bump();
                }
                Some(b'}') => {
                    depth -= 1;
                    if depth == 0 {
                        let body = self.src[start..self.pos].trim().to_string();
                        self.bump();
                        return Ok(body);
                    }
                    self.bump();
                }
                Some(_) => {
                    self.bump();
                }
                None => return Err(self.fail_at(line, col, "unterminated code block".into())),
            }
        }
    }
}
