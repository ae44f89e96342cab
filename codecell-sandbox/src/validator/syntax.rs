//! Lexing and outline extraction for structural analysis
//!
//! The lexers strip comments and recognise string literals for each language family, so
//! rule matching never fires on text inside a comment. The outline builders walk the token
//! stream and extract the constructs the rule table cares about: imports (with the local
//! names they bind), calls (with aliases resolved to module paths), attribute chains, and
//! shell commands.

use crate::types::Language;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Ident,
    Str,
    Number,
    Punct,
    Newline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
    /// Shell only: starts right where the previous word ended (`a"b"`, `$x$y`)
    pub glued: bool,
}

impl Token {
    fn is_punct(&self, p: &str) -> bool {
        self.kind == TokenKind::Punct && self.text == p
    }

    fn is_ident(&self, s: &str) -> bool {
        self.kind == TokenKind::Ident && self.text == s
    }
}

/// Imported module
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Import {
    pub module: String,
    pub line: usize,
}

/// Literal arguments captured from a call site
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CallArgs {
    /// One entry per positional argument; `Some` when the argument is a string literal
    pub positional: Vec<Option<String>>,
    /// Keyword arguments (`name=value`)
    pub keywords: Vec<(String, Option<String>)>,
}

impl CallArgs {
    /// Mode argument of an `open`-style call: `None` when absent, `Some(None)` when present
    /// but not a literal.
    pub fn mode(&self) -> Option<Option<&str>> {
        if let Some((_, value)) = self.keywords.iter().find(|(name, _)| name == "mode") {
            return Some(value.as_deref());
        }
        self.positional.get(1).map(|value| value.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Call {
    /// Callee path with aliases resolved; method calls on expressions start with `.`
    pub path: String,
    pub args: CallArgs,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Access {
    pub path: String,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ShellCommand {
    pub name: String,
    pub args: Vec<String>,
    pub line: usize,
    /// The name is only known after expansion (`$cmd`, `"r"m`, `$(...)`)
    pub dynamic: bool,
}

/// Capability-relevant constructs found in a snippet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Outline {
    pub imports: Vec<Import>,
    pub calls: Vec<Call>,
    pub attributes: Vec<Access>,
    pub commands: Vec<ShellCommand>,
}

/// Build the outline for a snippet
pub(crate) fn outline(source: &str, language: Language) -> Outline {
    match language {
        Language::Python => code_outline(&tokenize(source, language), Dialect::Python),
        Language::JavaScript | Language::TypeScript => {
            code_outline(&tokenize(source, language), Dialect::Script)
        }
        Language::Shell => Outline {
            commands: shell_commands(&tokenize(source, language), 0),
            ..Default::default()
        },
    }
}

pub(crate) fn tokenize(source: &str, language: Language) -> Vec<Token> {
    let mut lexer = Lexer::new(source);
    match language {
        Language::Python => lexer.lex_python(),
        Language::JavaScript | Language::TypeScript => lexer.lex_script(),
        Language::Shell => lexer.lex_shell(),
    }
    lexer.tokens
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    tokens: Vec<Token>,
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

const SHELL_SPECIAL: &[char] = &[';', '|', '&', '(', ')', '<', '>', '`', '\'', '"'];

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            tokens: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn push(&mut self, kind: TokenKind, text: impl Into<String>, line: usize) {
        self.tokens.push(Token {
            kind,
            text: text.into(),
            line,
            glued: false,
        });
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            out.push(c);
            self.pos += 1;
        }
        out
    }

    fn newline(&mut self) {
        let line = self.line;
        self.bump();
        self.push(TokenKind::Newline, "\n", line);
    }

    fn number(&mut self) {
        let line = self.line;
        let text = self.take_while(|c| c.is_alphanumeric() || c == '.' || c == '_');
        self.push(TokenKind::Number, text, line);
    }

    fn punct(&mut self) {
        let line = self.line;
        if let Some(c) = self.bump() {
            self.push(TokenKind::Punct, c.to_string(), line);
        }
    }

    /// Single-line quoted string with backslash escapes
    fn quoted(&mut self, line: usize) {
        let Some(quote) = self.bump() else { return };
        let mut content = String::new();
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
            if c == '\\' {
                if let Some(next) = self.bump() {
                    content.push(next);
                }
                continue;
            }
            if c == quote {
                break;
            }
            content.push(c);
        }
        self.push(TokenKind::Str, content, line);
    }

    fn lex_python(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                '\n' => self.newline(),
                '\\' if self.peek_at(1) == Some('\n') => {
                    self.bump();
                    self.bump();
                }
                '#' => self.skip_line(),
                '\'' | '"' => {
                    let line = self.line;
                    self.python_string(line);
                }
                c if c.is_whitespace() => {
                    self.bump();
                }
                c if is_ident_start(c) => {
                    let line = self.line;
                    let word = self.take_while(is_ident_continue);
                    let prefixed = matches!(self.peek(), Some('\'') | Some('"'))
                        && matches!(
                            word.to_ascii_lowercase().as_str(),
                            "r" | "b" | "f" | "u" | "rb" | "br" | "fr" | "rf"
                        );
                    if prefixed {
                        self.python_string(line);
                    } else {
                        self.push(TokenKind::Ident, word, line);
                    }
                }
                c if c.is_ascii_digit() => self.number(),
                _ => self.punct(),
            }
        }
    }

    fn python_string(&mut self, line: usize) {
        let Some(quote) = self.peek() else { return };
        let triple = self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote);
        if !triple {
            self.quoted(line);
            return;
        }
        self.bump();
        self.bump();
        self.bump();
        let mut content = String::new();
        while let Some(c) = self.bump() {
            if c == '\\' {
                if let Some(next) = self.bump() {
                    content.push(next);
                }
                continue;
            }
            if c == quote && self.peek() == Some(quote) && self.peek_at(1) == Some(quote) {
                self.bump();
                self.bump();
                break;
            }
            content.push(c);
        }
        self.push(TokenKind::Str, content, line);
    }

    fn lex_script(&mut self) {
        let mut brace_depth = 0usize;
        let mut templates: Vec<usize> = Vec::new();
        while let Some(c) = self.peek() {
            match c {
                '\n' => self.newline(),
                '/' if self.peek_at(1) == Some('/') => self.skip_line(),
                '/' if self.peek_at(1) == Some('*') => {
                    self.bump();
                    self.bump();
                    while let Some(c) = self.bump() {
                        if c == '*' && self.peek() == Some('/') {
                            self.bump();
                            break;
                        }
                    }
                }
                '\'' | '"' => {
                    let line = self.line;
                    self.quoted(line);
                }
                '`' => {
                    self.bump();
                    self.template_chunk(&mut templates, brace_depth);
                }
                '{' => {
                    brace_depth += 1;
                    self.punct();
                }
                '}' => {
                    if templates.last() == Some(&brace_depth) {
                        templates.pop();
                        self.bump();
                        self.template_chunk(&mut templates, brace_depth);
                    } else {
                        brace_depth = brace_depth.saturating_sub(1);
                        self.punct();
                    }
                }
                c if c.is_whitespace() => {
                    self.bump();
                }
                c if is_ident_start(c) || c == '$' => {
                    let line = self.line;
                    let word = self.take_while(|c| is_ident_continue(c) || c == '$');
                    self.push(TokenKind::Ident, word, line);
                }
                c if c.is_ascii_digit() => self.number(),
                _ => self.punct(),
            }
        }
    }

    /// Template literal text up to the closing backtick or the next `${`
    fn template_chunk(&mut self, templates: &mut Vec<usize>, brace_depth: usize) {
        let line = self.line;
        let mut content = String::new();
        while let Some(c) = self.bump() {
            match c {
                '\\' => {
                    if let Some(next) = self.bump() {
                        content.push(next);
                    }
                }
                '`' => break,
                '$' if self.peek() == Some('{') => {
                    self.bump();
                    templates.push(brace_depth);
                    break;
                }
                c => content.push(c),
            }
        }
        self.push(TokenKind::Str, content, line);
    }

    fn lex_shell(&mut self) {
        let mut last_end = None;
        while let Some(c) = self.peek() {
            let start = self.pos;
            let before = self.tokens.len();
            match c {
                '\n' => self.newline(),
                '\\' if self.peek_at(1) == Some('\n') => {
                    self.bump();
                    self.bump();
                }
                '#' => self.skip_line(),
                '\'' => {
                    let line = self.line;
                    self.bump();
                    let content = self.take_while(|c| c != '\'');
                    self.line += content.matches('\n').count();
                    self.bump();
                    self.push(TokenKind::Str, content, line);
                }
                '"' => {
                    let line = self.line;
                    self.bump();
                    let mut content = String::new();
                    while let Some(c) = self.bump() {
                        match c {
                            '\\' => {
                                if let Some(next) = self.bump() {
                                    content.push(next);
                                }
                            }
                            '"' => break,
                            c => content.push(c),
                        }
                    }
                    self.push(TokenKind::Str, content, line);
                }
                '$' if self.peek_at(1) == Some('(') => {
                    let line = self.line;
                    self.bump();
                    self.bump();
                    self.push(TokenKind::Punct, "$(", line);
                }
                c if c.is_whitespace() => {
                    self.bump();
                }
                c if SHELL_SPECIAL.contains(&c) => self.punct(),
                _ => {
                    let line = self.line;
                    let mut word = String::new();
                    while let Some(c) = self.peek() {
                        if c.is_whitespace() || SHELL_SPECIAL.contains(&c) {
                            break;
                        }
                        if c == '$' && self.peek_at(1) == Some('(') {
                            break;
                        }
                        self.bump();
                        if c == '\\' {
                            if let Some(next) = self.bump() {
                                word.push(next);
                            }
                            continue;
                        }
                        word.push(c);
                    }
                    self.push(TokenKind::Ident, word, line);
                }
            }
            if self.tokens.len() > before {
                let glued = last_end == Some(start)
                    && before > 0
                    && self.tokens[before - 1].kind != TokenKind::Newline;
                self.tokens[before].glued = glued;
                last_end = Some(self.pos);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Python,
    Script,
}

fn normalize_module(dialect: Dialect, module: &str) -> String {
    match dialect {
        Dialect::Script => module.strip_prefix("node:").unwrap_or(module).to_string(),
        Dialect::Python => module.to_string(),
    }
}

fn at_statement_start(tokens: &[Token], i: usize) -> bool {
    match i.checked_sub(1).map(|p| &tokens[p]) {
        None => true,
        Some(prev) => {
            prev.kind == TokenKind::Newline || prev.is_punct(";") || prev.is_punct(":")
        }
    }
}

/// Read `ident (. ident)*`, accepting `?.` as a separator. Returns segments and the index
/// of the first token after the chain.
fn read_chain(tokens: &[Token], start: usize) -> (Vec<String>, usize) {
    let mut segments = vec![tokens[start].text.clone()];
    let mut i = start + 1;
    loop {
        let sep = match tokens.get(i) {
            Some(t) if t.is_punct(".") => 1,
            Some(t) if t.is_punct("?") && tokens.get(i + 1).is_some_and(|n| n.is_punct(".")) => 2,
            _ => break,
        };
        match tokens.get(i + sep) {
            Some(next) if next.kind == TokenKind::Ident => {
                segments.push(next.text.clone());
                i += sep + 1;
            }
            _ => break,
        }
    }
    (segments, i)
}

/// Capture literal arguments of the call whose `(` sits at `open`
fn parse_args(tokens: &[Token], open: usize) -> CallArgs {
    let mut args = CallArgs::default();
    let mut depth = 0usize;
    let mut current: Vec<&Token> = Vec::new();

    let flush = |current: &mut Vec<&Token>, args: &mut CallArgs| {
        let parts: Vec<&Token> = current
            .drain(..)
            .filter(|t| t.kind != TokenKind::Newline)
            .collect();
        if parts.is_empty() {
            return;
        }
        if parts.len() >= 2 && parts[0].kind == TokenKind::Ident && parts[1].is_punct("=") {
            let literal = (parts.len() == 3 && parts[2].kind == TokenKind::Str)
                .then(|| parts[2].text.clone());
            args.keywords.push((parts[0].text.clone(), literal));
        } else {
            let literal = (parts.len() == 1 && parts[0].kind == TokenKind::Str)
                .then(|| parts[0].text.clone());
            args.positional.push(literal);
        }
    };

    for token in &tokens[open..] {
        if token.kind == TokenKind::Punct {
            match token.text.as_str() {
                "(" | "[" | "{" => {
                    depth += 1;
                    if depth == 1 {
                        continue;
                    }
                }
                ")" | "]" | "}" => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        flush(&mut current, &mut args);
                        break;
                    }
                }
                "," if depth == 1 => {
                    flush(&mut current, &mut args);
                    continue;
                }
                _ => {}
            }
        }
        if depth >= 1 {
            current.push(token);
        }
    }
    args
}

fn resolve(aliases: &HashMap<String, String>, segments: &[String]) -> String {
    match aliases.get(&segments[0]) {
        Some(target) if segments.len() > 1 => format!("{}.{}", target, segments[1..].join(".")),
        Some(target) => target.clone(),
        None => segments.join("."),
    }
}

fn dotted_name(tokens: &[Token], mut i: usize) -> (String, usize) {
    let mut name = String::new();
    while let Some(t) = tokens.get(i) {
        if t.is_punct(".") {
            name.push('.');
        } else if t.kind == TokenKind::Ident && !t.is_ident("import") && !t.is_ident("as") {
            if !name.is_empty() && !name.ends_with('.') {
                break;
            }
            name.push_str(&t.text);
        } else {
            break;
        }
        i += 1;
    }
    (name, i)
}

fn join_module(module: &str, name: &str) -> String {
    if module.ends_with('.') {
        format!("{}{}", module, name)
    } else {
        format!("{}.{}", module, name)
    }
}

/// `import a.b as c, d`
fn parse_py_import(
    tokens: &[Token],
    mut i: usize,
    line: usize,
    out: &mut Outline,
    aliases: &mut HashMap<String, String>,
) -> usize {
    loop {
        let (module, next) = dotted_name(tokens, i);
        if module.is_empty() {
            return next.max(i + 1);
        }
        i = next;
        if tokens.get(i).is_some_and(|t| t.is_ident("as")) {
            if let Some(alias) = tokens.get(i + 1).filter(|t| t.kind == TokenKind::Ident) {
                aliases.insert(alias.text.clone(), module.clone());
            }
            i += 2;
        }
        out.imports.push(Import { module, line });
        if tokens.get(i).is_some_and(|t| t.is_punct(",")) {
            i += 1;
        } else {
            return i;
        }
    }
}

/// `from a.b import (c as d, e)`
fn parse_py_from(
    tokens: &[Token],
    i: usize,
    line: usize,
    out: &mut Outline,
    aliases: &mut HashMap<String, String>,
) -> usize {
    let (module, mut i) = dotted_name(tokens, i);
    if module.is_empty() || !tokens.get(i).is_some_and(|t| t.is_ident("import")) {
        return i.max(1);
    }
    i += 1;
    out.imports.push(Import {
        module: module.clone(),
        line,
    });
    let parenthesized = tokens.get(i).is_some_and(|t| t.is_punct("("));
    if parenthesized {
        i += 1;
    }
    while let Some(t) = tokens.get(i) {
        if t.kind == TokenKind::Newline && !parenthesized {
            break;
        }
        if t.is_punct(")") || t.is_punct(";") {
            i += 1;
            break;
        }
        if t.kind == TokenKind::Ident {
            let name = t.text.clone();
            let mut bound = name.clone();
            if tokens.get(i + 1).is_some_and(|t| t.is_ident("as")) {
                if let Some(alias) = tokens.get(i + 2).filter(|t| t.kind == TokenKind::Ident) {
                    bound = alias.text.clone();
                }
                i += 2;
            }
            let qualified = join_module(&module, &name);
            aliases.insert(bound, qualified.clone());
            out.imports.push(Import {
                module: qualified,
                line,
            });
        }
        i += 1;
    }
    i
}

/// `import x, {a as b} from 'm'`, `import * as x from 'm'`, `import 'm'`
fn parse_es_import(
    tokens: &[Token],
    mut i: usize,
    line: usize,
    out: &mut Outline,
    aliases: &mut HashMap<String, String>,
) -> usize {
    let mut bindings: Vec<(String, Option<String>)> = Vec::new();
    let mut in_braces = false;
    while let Some(t) = tokens.get(i) {
        match t.kind {
            TokenKind::Str => {
                let module = normalize_module(Dialect::Script, &t.text);
                for (local, imported) in bindings {
                    let target = match imported {
                        Some(name) => format!("{}.{}", module, name),
                        None => module.clone(),
                    };
                    aliases.insert(local, target);
                }
                out.imports.push(Import { module, line });
                return i + 1;
            }
            TokenKind::Newline if !in_braces => return i,
            TokenKind::Punct if t.text == ";" => return i + 1,
            TokenKind::Punct if t.text == "{" => in_braces = true,
            TokenKind::Punct if t.text == "}" => in_braces = false,
            TokenKind::Punct if t.text == "*" => {
                if tokens.get(i + 1).is_some_and(|n| n.is_ident("as")) {
                    if let Some(local) = tokens.get(i + 2) {
                        bindings.push((local.text.clone(), None));
                    }
                    i += 2;
                }
            }
            TokenKind::Ident if matches!(t.text.as_str(), "from" | "type" | "as") => {}
            TokenKind::Ident => {
                let name = t.text.clone();
                let local = if tokens.get(i + 1).is_some_and(|n| n.is_ident("as")) {
                    i += 2;
                    tokens.get(i).map(|n| n.text.clone()).unwrap_or_else(|| name.clone())
                } else {
                    name.clone()
                };
                let imported = in_braces.then_some(name);
                bindings.push((local, imported));
            }
            _ => {}
        }
        i += 1;
    }
    i
}

/// `const x = require('m')` or `const { a, b: c } = require('m')`
fn parse_require_binding(
    tokens: &[Token],
    i: usize,
    out: &mut Outline,
    aliases: &mut HashMap<String, String>,
) -> Option<usize> {
    let mut names: Vec<(String, Option<String>)> = Vec::new();
    let mut j = i;
    match tokens.get(j)? {
        t if t.kind == TokenKind::Ident => {
            names.push((t.text.clone(), None));
            j += 1;
        }
        t if t.is_punct("{") => {
            j += 1;
            while let Some(t) = tokens.get(j) {
                if t.is_punct("}") {
                    j += 1;
                    break;
                }
                if t.kind == TokenKind::Ident {
                    if tokens.get(j + 1).is_some_and(|n| n.is_punct(":")) {
                        let local = tokens.get(j + 2)?.text.clone();
                        names.push((local, Some(t.text.clone())));
                        j += 2;
                    } else {
                        names.push((t.text.clone(), Some(t.text.clone())));
                    }
                }
                j += 1;
            }
        }
        _ => return None,
    }
    let is_require = tokens.get(j).is_some_and(|t| t.is_punct("="))
        && tokens.get(j + 1).is_some_and(|t| t.is_ident("require"))
        && tokens.get(j + 2).is_some_and(|t| t.is_punct("("));
    if !is_require {
        return None;
    }
    let module_token = tokens.get(j + 3).filter(|t| t.kind == TokenKind::Str)?;
    let module = normalize_module(Dialect::Script, &module_token.text);
    for (local, imported) in names {
        let target = match imported {
            Some(name) => format!("{}.{}", module, name),
            None => module.clone(),
        };
        aliases.insert(local, target);
    }
    out.imports.push(Import {
        module,
        line: module_token.line,
    });
    Some(j + 4)
}

fn code_outline(tokens: &[Token], dialect: Dialect) -> Outline {
    let mut out = Outline::default();
    let mut aliases: HashMap<String, String> = HashMap::new();
    let mut i = 0;

    while i < tokens.len() {
        let token = &tokens[i];
        if token.kind != TokenKind::Ident {
            i += 1;
            continue;
        }
        let next = tokens.get(i + 1);

        match (dialect, token.text.as_str()) {
            (Dialect::Python, "import") if at_statement_start(tokens, i) => {
                i = parse_py_import(tokens, i + 1, token.line, &mut out, &mut aliases);
                continue;
            }
            (Dialect::Python, "from") if at_statement_start(tokens, i) => {
                i = parse_py_from(tokens, i + 1, token.line, &mut out, &mut aliases);
                continue;
            }
            (Dialect::Script, "import")
                if !next.is_some_and(|n| n.is_punct("(") || n.is_punct(".")) =>
            {
                i = parse_es_import(tokens, i + 1, token.line, &mut out, &mut aliases);
                continue;
            }
            (Dialect::Script, "const" | "let" | "var") => {
                if let Some(after) = parse_require_binding(tokens, i + 1, &mut out, &mut aliases)
                {
                    i = after;
                    continue;
                }
            }
            _ => {}
        }

        let prev = i.checked_sub(1).map(|p| &tokens[p]);
        if prev.is_some_and(|p| p.is_ident("def") || p.is_ident("function") || p.is_ident("class"))
        {
            i += 1;
            continue;
        }
        let method = prev.is_some_and(|p| p.is_punct("."));
        let (segments, end) = read_chain(tokens, i);
        let path = if method {
            format!(".{}", segments.join("."))
        } else {
            resolve(&aliases, &segments)
        };

        if tokens.get(end).is_some_and(|t| t.is_punct("(")) {
            let args = parse_args(tokens, end);
            if !method {
                let loads_module = match dialect {
                    Dialect::Script => path == "require" || path == "import",
                    Dialect::Python => path == "__import__" || path == "importlib.import_module",
                };
                if loads_module {
                    if let Some(Some(module)) = args.positional.first() {
                        out.imports.push(Import {
                            module: normalize_module(dialect, module),
                            line: token.line,
                        });
                    }
                }
            }
            out.calls.push(Call {
                path,
                args,
                line: token.line,
            });
            // Keep scanning inside the argument list for nested calls
            i = end + 1;
        } else {
            if segments.len() > 1 || method {
                out.attributes.push(Access {
                    path,
                    line: token.line,
                });
            }
            i = end;
        }
    }
    out
}

const SHELL_KEYWORDS: &[&str] = &[
    "if", "then", "else", "elif", "fi", "do", "done", "while", "until", "!", "time", "{", "}",
    "function", "esac", "in",
];

/// Programs that run their first operand as another command
const COMMAND_WRAPPERS: &[&str] = &[
    "env", "command", "builtin", "exec", "xargs", "nohup", "setsid", "timeout", "nice",
    "ionice", "stdbuf", "chrt", "taskset", "busybox", "watch", "flock", "unbuffer",
];

/// Wrapper options whose value is the next word
fn option_takes_value(wrapper: &str, option: &str) -> bool {
    let options: &[&str] = match wrapper {
        "env" => &["-u", "-C", "-S", "--unset", "--chdir", "--split-string"],
        "timeout" => &["-s", "-k", "--signal", "--kill-after"],
        "xargs" => &["-I", "-n", "-P", "-d", "-L", "-E", "-a", "-s", "--arg-file"],
        "nice" => &["-n", "--adjustment"],
        "ionice" => &["-c", "-n", "-p", "--class", "--classdata"],
        "stdbuf" => &["-i", "-o", "-e"],
        "watch" => &["-n", "--interval"],
        "taskset" => &["-c", "--cpu-list"],
        _ => &[],
    };
    options.contains(&option)
}

fn is_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            !name.is_empty() && name.chars().all(|c| c == '_' || c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

/// Words whose value depends on expansion when they name a command
fn is_dynamic_word(word: &str) -> bool {
    word.contains(['$', '`', '*', '?'])
        || (word.contains('[') && word != "[" && word != "[[")
        || (word.contains('{') && word.contains(','))
}

fn basename(word: &str) -> String {
    word.rsplit('/').next().unwrap_or(word).to_string()
}

/// The command a wrapper such as `env` or `timeout` would run
fn wrapped_command(command: &ShellCommand) -> Option<ShellCommand> {
    if !COMMAND_WRAPPERS.contains(&command.name.as_str()) {
        return None;
    }
    if command.name == "command" && command.args.iter().any(|a| a == "-v" || a == "-V") {
        return None;
    }
    let mut args = command.args.iter();
    while let Some(arg) = args.next() {
        if arg.starts_with('-') {
            if option_takes_value(&command.name, arg) {
                args.next();
            }
            continue;
        }
        // env assignments, nice levels, timeout durations, taskset masks
        let numeric = arg.starts_with(|c: char| c.is_ascii_digit())
            && arg.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == ',');
        if is_assignment(arg) || numeric {
            continue;
        }
        return Some(ShellCommand {
            name: basename(arg),
            args: args.cloned().collect(),
            line: command.line,
            dynamic: is_dynamic_word(arg),
        });
    }
    None
}

/// Record a command and whatever its wrappers would run
fn push_command(commands: &mut Vec<ShellCommand>, command: ShellCommand) {
    let mut next = wrapped_command(&command);
    commands.push(command);
    let mut depth = 0;
    while let Some(inner) = next.take() {
        depth += 1;
        if depth < 8 {
            next = wrapped_command(&inner);
        }
        commands.push(inner);
    }
}

fn shell_commands(tokens: &[Token], depth: usize) -> Vec<ShellCommand> {
    let mut commands = Vec::new();
    let mut current: Option<ShellCommand> = None;
    // A nested string is a word; commands start inside its substitutions
    let mut at_start = depth == 0;
    let mut skip_header = false;
    let mut redirect_target = false;
    let mut in_assignment = false;

    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::Newline => {
                if let Some(command) = current.take() {
                    push_command(&mut commands, command);
                }
                at_start = true;
                skip_header = false;
                in_assignment = false;
                continue;
            }
            TokenKind::Punct => {
                let substitution = token.text == "$(" || token.text == "`";
                if substitution
                    && at_start
                    && current.is_none()
                    && !in_assignment
                    && !skip_header
                    && !redirect_target
                {
                    // The command name is whatever the substitution prints
                    commands.push(ShellCommand {
                        name: token.text.clone(),
                        args: Vec::new(),
                        line: token.line,
                        dynamic: true,
                    });
                }
                in_assignment = false;
                match token.text.as_str() {
                    ">" | "<" => redirect_target = true,
                    _ => {
                        if let Some(command) = current.take() {
                            push_command(&mut commands, command);
                        }
                        at_start = true;
                        if token.text == ";" {
                            skip_header = false;
                        }
                    }
                }
                continue;
            }
            _ => {}
        }

        if token.kind == TokenKind::Str && depth < 4 && token.text.contains("$(") {
            let nested = tokenize(&token.text, Language::Shell);
            commands.extend(shell_commands(&nested, depth + 1).into_iter().map(|mut c| {
                c.line = token.line;
                c
            }));
        }

        if in_assignment {
            if token.glued {
                continue;
            }
            in_assignment = false;
        }
        if redirect_target {
            redirect_target = false;
            continue;
        }
        if skip_header {
            if token.is_ident("do") {
                skip_header = false;
                at_start = true;
            }
            continue;
        }

        if at_start {
            if token.kind == TokenKind::Ident {
                if matches!(token.text.as_str(), "for" | "select" | "case") {
                    skip_header = true;
                    continue;
                }
                if SHELL_KEYWORDS.contains(&token.text.as_str()) {
                    continue;
                }
                if is_assignment(&token.text) {
                    in_assignment = true;
                    continue;
                }
            }
            // `r"m"` or `$a$b`: the word continues into the next token
            let continued = tokens
                .get(i + 1)
                .is_some_and(|next| next.glued && next.kind != TokenKind::Punct);
            current = Some(ShellCommand {
                name: basename(&token.text),
                args: Vec::new(),
                line: token.line,
                dynamic: continued || is_dynamic_word(&token.text),
            });
            at_start = false;
        } else if let Some(command) = current.as_mut() {
            command.args.push(token.text.clone());
        }
    }
    if let Some(command) = current {
        push_command(&mut commands, command);
    }
    commands
}
