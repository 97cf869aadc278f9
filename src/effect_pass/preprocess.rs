//! Source-level helpers for fusing WGSL fragments: a small `#ifdef`
//! preprocessor and an identifier rewriter that skips comments, numbers,
//! member accesses, attributes and names the fragment declares for itself.

use std::collections::HashSet;

const KEYWORDS: &[&str] = &[
    "alias", "break", "case", "const", "const_assert", "continue", "continuing", "default",
    "diagnostic", "discard", "else", "enable", "false", "fn", "for", "if", "let", "loop",
    "override", "requires", "return", "struct", "switch", "true", "var", "while", "bool",
    "f16", "f32", "i32", "u32", "vec2f", "vec3f", "vec4f", "vec2", "vec3", "vec4", "mat2x2f",
    "mat3x3f", "mat4x4f", "array", "sampler", "texture_2d", "ptr", "function", "private",
    "uniform", "storage", "workgroup",
];

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with("__")
        && name != "_"
}

pub(crate) fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

/// Evaluates `#ifdef`, `#ifndef`, `#else` and `#endif` against `defined`.
///
/// Directive lines are dropped from the output; inactive lines become empty
/// so line numbers in driver diagnostics still match the effect source.
pub(crate) fn preprocess(source: &str, defined: &HashSet<&str>) -> Result<String, String> {
    // (branch active, enclosing active, else seen)
    let mut stack: Vec<(bool, bool, bool)> = Vec::new();
    let mut out = String::with_capacity(source.len());
    let active = |stack: &Vec<(bool, bool, bool)>| stack.last().is_none_or(|s| s.0 && s.1);

    for (line_no, line) in source.lines().enumerate() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix('#') {
            let mut parts = rest.split_whitespace();
            let directive = parts.next().unwrap_or("");
            let arg = parts.next();
            let parent = active(&stack);
            match (directive, arg) {
                ("ifdef", Some(name)) => stack.push((defined.contains(name), parent, false)),
                ("ifndef", Some(name)) => stack.push((!defined.contains(name), parent, false)),
                ("else", None) => match stack.last_mut() {
                    Some(top) if !top.2 => {
                        top.0 = !top.0;
                        top.2 = true;
                    }
                    _ => return Err(format!("line {}: unexpected #else", line_no + 1)),
                },
                ("endif", None) => {
                    if stack.pop().is_none() {
                        return Err(format!("line {}: unexpected #endif", line_no + 1));
                    }
                }
                _ => {
                    return Err(format!(
                        "line {}: unsupported directive `{}`",
                        line_no + 1,
                        trimmed
                    ));
                }
            }
            out.push('\n');
            continue;
        }
        if active(&stack) {
            out.push_str(line);
        }
        out.push('\n');
    }

    if !stack.is_empty() {
        return Err(format!("{} unterminated #ifdef block(s)", stack.len()));
    }
    Ok(out)
}

/// Names introduced at module scope by `fn` and `struct` declarations.
pub(crate) fn declared_items(source: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut expect_name = false;
    scan(source, |token| {
        if let Token::Ident { text, .. } = token {
            if expect_name {
                if !out.iter().any(|n| n == text) {
                    out.push(text.to_string());
                }
                expect_name = false;
            } else if text == "fn" || text == "struct" {
                expect_name = true;
            }
        }
    });
    out
}

/// Replaces free identifiers for which `rename` returns a substitute.
///
/// Parameters, locals and struct members are left alone, as is every use of
/// a name inside the scope of a parameter or local that shadows it.
pub(crate) fn rewrite_identifiers(source: &str, rename: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(source.len() + source.len() / 4);
    let mut scopes = Scopes::default();
    scan(source, |token| match token {
        Token::Ident { text, free: true } => {
            let replacement = scopes.ident(text).then(|| rename(text)).flatten();
            out.push_str(replacement.as_deref().unwrap_or(text));
        }
        Token::Ident { text, .. } => out.push_str(text),
        Token::Other(text) => {
            scopes.punct(text);
            out.push_str(text);
        }
    });
    out
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Mode {
    #[default]
    Code,
    /// Between `fn` and its parameter list.
    FnHeader,
    /// Inside the parameter list; `true` when the next identifier names a parameter.
    Params(bool),
    /// After `let`, `var` or `const`.
    LocalName,
    /// A `struct` header or body; `true` when the next identifier names a member.
    Struct(bool),
}

/// Lexical scopes of the names a WGSL fragment declares for itself.
#[derive(Debug)]
struct Scopes {
    /// Module scope first, then one entry per open block.
    blocks: Vec<Vec<String>>,
    /// Names that enter scope when the next block opens: parameters and
    /// `for` initializers.
    next_block: Vec<String>,
    parens: usize,
    param_depth: usize,
    mode: Mode,
    /// A local whose declaration has not ended yet, with its paren depth.
    pending: Option<(String, usize)>,
}

impl Default for Scopes {
    fn default() -> Self {
        Self {
            blocks: vec![Vec::new()],
            next_block: Vec::new(),
            parens: 0,
            param_depth: 0,
            mode: Mode::Code,
            pending: None,
        }
    }
}

impl Scopes {
    fn is_shadowed(&self, name: &str) -> bool {
        self.blocks
            .iter()
            .chain([&self.next_block])
            .any(|b| b.iter().any(|n| n == name))
    }

    /// Returns whether `text` is a use that may be renamed.
    fn ident(&mut self, text: &str) -> bool {
        match self.mode {
            Mode::Code => {
                match text {
                    "fn" => self.mode = Mode::FnHeader,
                    "let" | "var" | "const" => self.mode = Mode::LocalName,
                    "struct" => self.mode = Mode::Struct(false),
                    _ => return !self.is_shadowed(text),
                }
                false
            }
            Mode::FnHeader => true,
            Mode::Params(true) if self.parens == self.param_depth => {
                self.next_block.push(text.to_string());
                self.mode = Mode::Params(false);
                false
            }
            Mode::Params(_) | Mode::Struct(false) => !self.is_shadowed(text),
            Mode::LocalName => {
                // `var<function> name`
                if !matches!(text, "function" | "private" | "workgroup" | "uniform" | "storage") {
                    self.pending = Some((text.to_string(), self.parens));
                    self.mode = Mode::Code;
                }
                false
            }
            Mode::Struct(true) => {
                self.mode = Mode::Struct(false);
                false
            }
        }
    }

    fn punct(&mut self, text: &str) {
        match text {
            "(" => {
                self.parens += 1;
                if self.mode == Mode::FnHeader {
                    self.param_depth = self.parens;
                    self.mode = Mode::Params(true);
                }
            }
            ")" => {
                if matches!(self.mode, Mode::Params(_)) && self.parens == self.param_depth {
                    self.mode = Mode::Code;
                }
                self.parens = self.parens.saturating_sub(1);
            }
            "," => match self.mode {
                Mode::Params(_) if self.parens == self.param_depth => self.mode = Mode::Params(true),
                Mode::Struct(_) => self.mode = Mode::Struct(true),
                _ => {}
            },
            "{" => {
                if let Mode::Struct(_) = self.mode {
                    self.mode = Mode::Struct(true);
                    self.blocks.push(Vec::new());
                } else {
                    self.blocks.push(std::mem::take(&mut self.next_block));
                }
            }
            "}" => {
                if let Mode::Struct(_) = self.mode {
                    self.mode = Mode::Code;
                }
                if self.blocks.len() > 1 {
                    self.blocks.pop();
                }
                self.pending = None;
            }
            ";" => {
                let parens = self.parens;
                if let Some((name, depth)) = self.pending.take_if(|(_, d)| *d == parens) {
                    if depth > 0 {
                        self.next_block.push(name);
                    } else if let Some(block) = self.blocks.last_mut() {
                        block.push(name);
                    }
                }
            }
            _ => {}
        }
    }
}

enum Token<'a> {
    /// `free` is false after `.` or `@`.
    Ident { text: &'a str, free: bool },
    Other(&'a str),
}

fn scan<'a>(source: &'a str, mut emit: impl FnMut(Token<'a>)) {
    let bytes = source.as_bytes();
    let mut i = 0;
    let mut last_significant: Option<u8> = None;
    while i < bytes.len() {
        let b = bytes[i];
        let start = i;
        if b == b'/' && bytes.get(i + 1) == Some(&b'/') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            emit(Token::Other(&source[start..i]));
            continue;
        }
        if b == b'/' && bytes.get(i + 1) == Some(&b'*') {
            i += 2;
            while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                i += 1;
            }
            i = (i + 2).min(bytes.len());
            emit(Token::Other(&source[start..i]));
            continue;
        }
        if b.is_ascii_alphabetic() || b == b'_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let free = !matches!(last_significant, Some(b'.') | Some(b'@'));
            emit(Token::Ident {
                text: &source[start..i],
                free,
            });
            last_significant = Some(b'a');
            continue;
        }
        if b.is_ascii_digit() {
            // Numbers with suffixes and exponents (`1u`, `2.5e-3f`).
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.') {
                let exp = matches!(bytes[i], b'e' | b'E');
                i += 1;
                if exp && matches!(bytes.get(i), Some(b'+') | Some(b'-')) {
                    i += 1;
                }
            }
            emit(Token::Other(&source[start..i]));
            last_significant = Some(b'0');
            continue;
        }
        // Non-ASCII text only appears in comments, which are handled above;
        // copy whole UTF-8 sequences anyway.
        let len = source[i..].chars().next().map_or(1, char::len_utf8);
        i += len;
        if !b.is_ascii_whitespace() {
            last_significant = Some(b);
        }
        emit(Token::Other(&source[start..i]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ifdef_selects_branches() {
        let defined: HashSet<&str> = ["A"].into_iter().collect();
        let src = "#ifdef A\na\n#else\nnot_a\n#endif\n#ifndef B\nb\n#endif\n";
        let out = preprocess(src, &defined).unwrap();
        let lines: Vec<&str> = out.lines().filter(|l| !l.is_empty()).collect();
        assert_eq!(lines, ["a", "b"]);
    }

    #[test]
    fn nested_inactive_blocks_stay_inactive() {
        let defined: HashSet<&str> = ["B"].into_iter().collect();
        let src = "#ifdef A\n#ifdef B\nab\n#else\na_only\n#endif\n#endif\nafter\n";
        let out = preprocess(src, &defined).unwrap();
        let lines: Vec<&str> = out.lines().filter(|l| !l.is_empty()).collect();
        assert_eq!(lines, ["after"]);
    }

    #[test]
    fn unbalanced_directives_are_errors() {
        let none = HashSet::new();
        assert!(preprocess("#ifdef A\nx\n", &none).is_err());
        assert!(preprocess("#endif\n", &none).is_err());
        assert!(preprocess("#ifdef A\n#else\n#else\n#endif\n", &none).is_err());
        assert!(preprocess("#define A 1\n", &none).is_err());
    }

    #[test]
    fn rewrite_skips_members_comments_and_numbers() {
        let src = "let a = amount * v.amount; // amount\n@builtin(position) x = 1e-3 + amount2;";
        let out = rewrite_identifiers(src, |name| match name {
            "amount" => Some("fx.amount_1.x".to_string()),
            "builtin" | "e" => Some("bad".to_string()),
            _ => None,
        });
        assert_eq!(
            out,
            "let a = fx.amount_1.x * v.amount; // amount\n@builtin(position) x = 1e-3 + amount2;"
        );
    }

    #[test]
    fn rewrite_respects_parameters_and_locals() {
        let src = "\
struct Tap { strength: f32, w: f32 }
fn apply(c: vec4f, strength: f32) -> vec4f {
    return c * strength;
}
fn main_image(input_color: vec4f, uv: vec2f) -> vec4f {
    let a = apply(input_color, strength);
    let strength = strength * 2.0;
    for (var w = 0.0; w < strength; w += 1.0) {
        a = a + w;
    }
    return a * strength + w;
}
fn after() -> f32 { return strength; }
";
        let out = rewrite_identifiers(src, |name| match name {
            "strength" => Some("fx.strength.x".to_string()),
            "w" => Some("fx.w.x".to_string()),
            _ => None,
        });
        assert_eq!(
            out,
            "\
struct Tap { strength: f32, w: f32 }
fn apply(c: vec4f, strength: f32) -> vec4f {
    return c * strength;
}
fn main_image(input_color: vec4f, uv: vec2f) -> vec4f {
    let a = apply(input_color, fx.strength.x);
    let strength = fx.strength.x * 2.0;
    for (var w = 0.0; w < strength; w += 1.0) {
        a = a + w;
    }
    return a * strength + fx.w.x;
}
fn after() -> f32 { return fx.strength.x; }
"
        );
    }

    #[test]
    fn declared_items_finds_functions_and_structs() {
        let src = "struct Sample { v: f32 }\nfn helper() -> f32 { return 1.0; }\n/* fn ghost() */\nfn main_image(c: vec4f, uv: vec2f) -> vec4f { return c; }";
        assert_eq!(declared_items(src), ["Sample", "helper", "main_image"]);
    }

    #[test]
    fn identifier_rules() {
        assert!(is_identifier("intensity"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier("__reserved"));
        assert!(is_keyword("return"));
        assert!(!is_keyword("intensity"));
    }
}
