//! Büchi automaton of a liveness property, read from a Promela never-claim
//! as produced by `ltl2ba`:
//!
//! ```text
//! never { /* !(p) */
//! T0_init :
//!     if
//!     :: (!p) -> goto accept_S1
//!     :: (1) -> goto T0_init
//!     fi;
//! accept_S1 :
//!     skip
//! }
//! ```
//!
//! States named `accept_*` are accepting and states named `*_init` are
//! initial. `skip` loops on the state unconditionally; `false` leaves it
//! without transitions.

use std::fmt;
use std::fs;
use std::path::Path;

use thiserror::Error;

/// Errors loading a never-claim.
#[derive(Debug, Error)]
pub enum AutomatonError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("line {line}: expected {expected}, found {found}")]
    UnexpectedToken {
        expected: String,
        found: String,
        line: u32,
    },

    #[error("line {line}: unexpected character {found:?}")]
    InvalidCharacter { found: char, line: u32 },

    #[error("no initial state (a state named *_init)")]
    NoInitialState,

    #[error("proposition {0} is not registered by the checked program")]
    UnknownProposition(String),
}

/// Condition on the propositions guarding a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Label {
    Or(Box<Label>, Box<Label>),
    And(Box<Label>, Box<Label>),
    Not(Box<Label>),
    Predicate(String),
    One,
    Zero,
}

impl Label {
    /// Evaluate with `value` giving the truth of each proposition.
    pub fn eval(&self, value: &dyn Fn(&str) -> bool) -> bool {
        match self {
            Label::Or(l, r) => l.eval(value) || r.eval(value),
            Label::And(l, r) => l.eval(value) && r.eval(value),
            Label::Not(l) => !l.eval(value),
            Label::Predicate(name) => value(name),
            Label::One => true,
            Label::Zero => false,
        }
    }

    fn collect_predicates<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Label::Or(l, r) | Label::And(l, r) => {
                l.collect_predicates(out);
                r.collect_predicates(out);
            }
            Label::Not(l) => l.collect_predicates(out),
            Label::Predicate(name) => out.push(name),
            Label::One | Label::Zero => {}
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Or(l, r) => write!(f, "({l} || {r})"),
            Label::And(l, r) => write!(f, "({l} && {r})"),
            Label::Not(l) => write!(f, "!{l}"),
            Label::Predicate(name) => f.write_str(name),
            Label::One => f.write_str("1"),
            Label::Zero => f.write_str("0"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomatonState {
    pub id: String,
    pub accepting: bool,
    pub initial: bool,
}

impl AutomatonState {
    fn named(id: &str) -> Self {
        let first = id.split('_').next().unwrap_or(id);
        let last = id.rsplit('_').next().unwrap_or(id);
        let has_parts = id.contains('_');
        Self {
            id: id.to_owned(),
            accepting: first == "accept",
            initial: has_parts && last == "init",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomatonTransition {
    pub src: usize,
    pub dst: usize,
    pub label: Label,
}

#[derive(Debug, Clone, Default)]
pub struct Automaton {
    states: Vec<AutomatonState>,
    transitions: Vec<AutomatonTransition>,
    propositions: Vec<String>,
}

impl Automaton {
    pub fn load(path: &Path) -> Result<Self, AutomatonError> {
        let text = fs::read_to_string(path).map_err(|source| AutomatonError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, AutomatonError> {
        let tokens = Lexer::new(text).tokenize()?;
        let mut automaton = Parser::new(tokens).parse_never_claim()?;
        if !automaton.states.iter().any(|s| s.initial) {
            return Err(AutomatonError::NoInitialState);
        }

        let mut names = Vec::new();
        for transition in &automaton.transitions {
            transition.label.collect_predicates(&mut names);
        }
        for name in names {
            if !automaton.propositions.iter().any(|p| p == name) {
                automaton.propositions.push(name.to_owned());
            }
        }
        Ok(automaton)
    }

    pub fn states(&self) -> &[AutomatonState] {
        &self.states
    }

    pub fn state(&self, index: usize) -> &AutomatonState {
        &self.states[index]
    }

    pub fn transitions(&self) -> &[AutomatonTransition] {
        &self.transitions
    }

    /// Propositions the labels refer to, in order of first use.
    pub fn propositions(&self) -> &[String] {
        &self.propositions
    }

    pub fn initial_states(&self) -> impl Iterator<Item = usize> + '_ {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.initial)
            .map(|(i, _)| i)
    }

    /// Transitions leaving `state`, in declaration order.
    pub fn outgoing(&self, state: usize) -> impl DoubleEndedIterator<Item = &AutomatonTransition> {
        self.transitions.iter().filter(move |t| t.src == state)
    }

    fn state_index(&mut self, id: &str) -> usize {
        if let Some(index) = self.states.iter().position(|s| s.id == id) {
            return index;
        }
        self.states.push(AutomatonState::named(id));
        self.states.len() - 1
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Lexer
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    Never,
    If,
    Fi,
    Goto,
    Skip,
    True,
    False,
    LBrace,
    RBrace,
    LParen,
    RParen,
    Colon,
    DoubleColon,
    Semi,
    Arrow,
    And,
    Or,
    Not,
    Ident(String),
    Number(u64),
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Never => f.write_str("never"),
            TokenKind::If => f.write_str("if"),
            TokenKind::Fi => f.write_str("fi"),
            TokenKind::Goto => f.write_str("goto"),
            TokenKind::Skip => f.write_str("skip"),
            TokenKind::True => f.write_str("true"),
            TokenKind::False => f.write_str("false"),
            TokenKind::LBrace => f.write_str("'{'"),
            TokenKind::RBrace => f.write_str("'}'"),
            TokenKind::LParen => f.write_str("'('"),
            TokenKind::RParen => f.write_str("')'"),
            TokenKind::Colon => f.write_str("':'"),
            TokenKind::DoubleColon => f.write_str("'::'"),
            TokenKind::Semi => f.write_str("';'"),
            TokenKind::Arrow => f.write_str("'->'"),
            TokenKind::And => f.write_str("'&&'"),
            TokenKind::Or => f.write_str("'||'"),
            TokenKind::Not => f.write_str("'!'"),
            TokenKind::Ident(name) => write!(f, "identifier {name}"),
            TokenKind::Number(n) => write!(f, "number {n}"),
            TokenKind::Eof => f.write_str("end of file"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    line: u32,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, AutomatonError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if eof {
                return Ok(tokens);
            }
        }
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.chars.peek() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('/') => {
                    let mut ahead = self.chars.clone();
                    ahead.next();
                    if ahead.peek() != Some(&'*') {
                        return;
                    }
                    self.advance();
                    self.advance();
                    let mut star = false;
                    while let Some(c) = self.advance() {
                        if star && c == '/' {
                            break;
                        }
                        star = c == '*';
                    }
                }
                _ => return,
            }
        }
    }

    /// Consume `second` if it comes next.
    fn follows(&mut self, second: char) -> bool {
        if self.chars.peek() == Some(&second) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn next_token(&mut self) -> Result<Token, AutomatonError> {
        self.skip_trivia();
        let line = self.line;
        let token = |kind| Ok(Token { kind, line });

        let Some(c) = self.advance() else {
            return token(TokenKind::Eof);
        };
        match c {
            '{' => token(TokenKind::LBrace),
            '}' => token(TokenKind::RBrace),
            '(' => token(TokenKind::LParen),
            ')' => token(TokenKind::RParen),
            ';' => token(TokenKind::Semi),
            '!' => token(TokenKind::Not),
            ':' if self.follows(':') => token(TokenKind::DoubleColon),
            ':' => token(TokenKind::Colon),
            '-' if self.follows('>') => token(TokenKind::Arrow),
            '&' if self.follows('&') => token(TokenKind::And),
            '|' if self.follows('|') => token(TokenKind::Or),
            c if c.is_ascii_digit() => {
                let mut value = u64::from(c as u8 - b'0');
                while let Some(&d) = self.chars.peek() {
                    let Some(digit) = d.to_digit(10) else { break };
                    value = value.saturating_mul(10).saturating_add(u64::from(digit));
                    self.advance();
                }
                token(TokenKind::Number(value))
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut word = String::from(c);
                while let Some(&d) = self.chars.peek() {
                    if !(d.is_alphanumeric() || d == '_') {
                        break;
                    }
                    word.push(d);
                    self.advance();
                }
                token(match word.as_str() {
                    "never" => TokenKind::Never,
                    "if" => TokenKind::If,
                    "fi" => TokenKind::Fi,
                    "goto" => TokenKind::Goto,
                    "skip" => TokenKind::Skip,
                    "true" => TokenKind::True,
                    "false" => TokenKind::False,
                    _ => TokenKind::Ident(word),
                })
            }
            found => Err(AutomatonError::InvalidCharacter { found, line }),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Parser
// ═══════════════════════════════════════════════════════════════════════

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &TokenKind {
        self.tokens
            .get(self.pos)
            .map_or(&TokenKind::Eof, |t| &t.kind)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos)
            .or(self.tokens.last())
            .map_or(0, |t| t.line)
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if kind != TokenKind::Eof {
            self.pos += 1;
        }
        kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn unexpected(&self, expected: &str) -> AutomatonError {
        AutomatonError::UnexpectedToken {
            expected: expected.to_owned(),
            found: self.peek().to_string(),
            line: self.line(),
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), AutomatonError> {
        if self.eat(&kind) {
            Ok(())
        } else {
            Err(self.unexpected(&kind.to_string()))
        }
    }

    fn ident(&mut self) -> Result<String, AutomatonError> {
        match self.peek() {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("state name")),
        }
    }

    fn parse_never_claim(&mut self) -> Result<Automaton, AutomatonError> {
        let mut automaton = Automaton::default();
        self.expect(TokenKind::Never)?;
        self.expect(TokenKind::LBrace)?;
        while !self.eat(&TokenKind::RBrace) {
            self.parse_state(&mut automaton)?;
        }
        self.expect(TokenKind::Eof)?;
        Ok(automaton)
    }

    /// `name : if :: (label) -> goto target ... fi;`, `name : skip` or
    /// `name : false;`
    fn parse_state(&mut self, automaton: &mut Automaton) -> Result<(), AutomatonError> {
        let id = self.ident()?;
        let src = automaton.state_index(&id);
        self.expect(TokenKind::Colon)?;

        if !matches!(
            self.peek(),
            TokenKind::If | TokenKind::Skip | TokenKind::False
        ) {
            return Err(self.unexpected("if, skip or false"));
        }
        match self.advance() {
            TokenKind::If => {
                while self.eat(&TokenKind::DoubleColon) {
                    let label = self.parse_label()?;
                    self.expect(TokenKind::Arrow)?;
                    self.expect(TokenKind::Goto)?;
                    let target = self.ident()?;
                    let dst = automaton.state_index(&target);
                    automaton.transitions.push(AutomatonTransition { src, dst, label });
                }
                self.expect(TokenKind::Fi)?;
            }
            TokenKind::Skip => automaton.transitions.push(AutomatonTransition {
                src,
                dst: src,
                label: Label::One,
            }),
            _ => {}
        }
        self.eat(&TokenKind::Semi);
        Ok(())
    }

    fn parse_label(&mut self) -> Result<Label, AutomatonError> {
        let mut left = self.parse_conjunction()?;
        while self.eat(&TokenKind::Or) {
            let right = self.parse_conjunction()?;
            left = Label::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_conjunction(&mut self) -> Result<Label, AutomatonError> {
        let mut left = self.parse_unary()?;
        while self.eat(&TokenKind::And) {
            let right = self.parse_unary()?;
            left = Label::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Label, AutomatonError> {
        if !matches!(
            self.peek(),
            TokenKind::Not
                | TokenKind::LParen
                | TokenKind::Ident(_)
                | TokenKind::Number(_)
                | TokenKind::True
                | TokenKind::False
        ) {
            return Err(self.unexpected("expression"));
        }
        match self.advance() {
            TokenKind::Not => Ok(Label::Not(Box::new(self.parse_unary()?))),
            TokenKind::LParen => {
                let inner = self.parse_label()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::Ident(name) => Ok(Label::Predicate(name)),
            TokenKind::Number(0) | TokenKind::False => Ok(Label::Zero),
            _ => Ok(Label::One),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOT_EVENTUALLY_CS: &str = "never { /* !(<>cs) */
T0_init :    /* init */
	if
	:: (!cs) -> goto accept_S1
	:: (1) -> goto T0_init
	fi;
accept_S1 :    /* 1 */
	if
	:: (!cs) -> goto accept_S1
	fi;
}
";

    #[test]
    fn parses_ltl2ba_output() {
        let automaton = Automaton::parse(NOT_EVENTUALLY_CS).unwrap();
        assert_eq!(automaton.states().len(), 2);
        assert_eq!(automaton.initial_states().collect::<Vec<_>>(), [0]);
        assert!(!automaton.state(0).accepting);
        assert!(automaton.state(1).accepting);
        assert_eq!(automaton.transitions().len(), 3);
        assert_eq!(automaton.propositions(), ["cs"]);

        let from_init: Vec<_> = automaton.outgoing(0).map(|t| t.dst).collect();
        assert_eq!(from_init, [1, 0]);
        assert_eq!(
            automaton.transitions()[0].label,
            Label::Not(Box::new(Label::Predicate("cs".into())))
        );
        assert_eq!(automaton.transitions()[1].label, Label::One);
    }

    #[test]
    fn skip_loops_and_false_blocks() {
        let automaton = Automaton::parse(
            "never { accept_init : skip \n T1_S2 : false; }",
        )
        .unwrap();
        let init = automaton.state(0);
        assert!(init.accepting && init.initial);
        assert_eq!(
            automaton.transitions(),
            [AutomatonTransition {
                src: 0,
                dst: 0,
                label: Label::One
            }]
        );
        assert_eq!(automaton.outgoing(1).count(), 0);
    }

    #[test]
    fn labels_follow_precedence() {
        let automaton = Automaton::parse(
            "never { T0_init : if :: (p || q && !r) -> goto T0_init fi; }",
        )
        .unwrap();
        let label = &automaton.transitions()[0].label;
        assert_eq!(label.to_string(), "(p || (q && !r))");
        assert_eq!(automaton.propositions(), ["p", "q", "r"]);

        let only_q = |name: &str| name == "q";
        assert!(label.eval(&only_q));
        let q_and_r = |name: &str| name == "q" || name == "r";
        assert!(!label.eval(&q_and_r));
        assert!(!Label::Zero.eval(&only_q));
    }

    #[test]
    fn missing_initial_state_is_rejected() {
        let err = Automaton::parse("never { accept_S1 : skip }").unwrap_err();
        assert!(matches!(err, AutomatonError::NoInitialState));
    }

    #[test]
    fn syntax_errors_carry_the_line() {
        let err = Automaton::parse("never {\nT0_init :\n if :: (p -> goto T0_init fi; }")
            .unwrap_err();
        match err {
            AutomatonError::UnexpectedToken { line, expected, .. } => {
                assert_eq!(line, 3);
                assert_eq!(expected, "')'");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            Automaton::parse("never { T0_init : skip } $"),
            Err(AutomatonError::InvalidCharacter { found: '$', .. })
        ));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("claim.never");
        fs::write(&path, NOT_EVENTUALLY_CS).unwrap();
        assert_eq!(Automaton::load(&path).unwrap().states().len(), 2);
        assert!(matches!(
            Automaton::load(&dir.path().join("missing")),
            Err(AutomatonError::Io { .. })
        ));
    }
}
