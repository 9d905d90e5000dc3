//! Resumable JSON token scanner
//!
//! A character-level automaton that turns a growing buffer into JSON tokens.
//! It never raises: when the input stops making sense the scanner halts and
//! keeps the automaton state and the partial token so callers can report
//! what they have so far. Feeding a document in any chunking produces the
//! same tokens as feeding it in one piece.
//!
//! ```text
//!   "{\"code\": \"pri"   ──feed──►  Operator('{')  String("code")  Operator(':')
//!                                   partial: String("pri")
//!   "nt(1)\"}"           ──feed──►  String("print(1)")  Operator('}')
//!                        ─finish─►  End
//! ```

/// A complete JSON token
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// One of `{ } [ ] , :`
    Operator(char),
    String(String),
    Number(Number),
    Boolean(bool),
    Null,
    /// Emitted once by [`Scanner::finish`] when the input ended cleanly
    End,
}

/// A JSON number, kept as an integer when it has no fraction or exponent
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Integer(i64),
    Float(f64),
}

/// Automaton state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Between tokens
    Whitespace,
    /// After a leading `-`
    IntegerSign,
    /// A lone leading `0`
    IntegerZero,
    Integer,
    /// After `.`, a digit is required
    FractionStart,
    Fraction,
    /// After `e`/`E`, a sign or digit is required
    ExponentStart,
    /// After the exponent sign, a digit is required
    ExponentSign,
    Exponent,
    String,
    StringEscape,
    /// Inside `\uXXXX`, with the number of hex digits read so far
    Unicode(u8),
    /// Inside `true`, `false` or `null`, with the number of characters matched
    Literal(Literal, u8),
    /// An invalid transition happened; further input is ignored
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Literal {
    True,
    False,
    Null,
}

impl Literal {
    fn text(self) -> &'static str {
        match self {
            Literal::True => "true",
            Literal::False => "false",
            Literal::Null => "null",
        }
    }

    fn token(self) -> Token {
        match self {
            Literal::True => Token::Boolean(true),
            Literal::False => Token::Boolean(false),
            Literal::Null => Token::Null,
        }
    }
}

/// A token that has started but not finished
#[derive(Debug, Clone, PartialEq)]
pub enum Partial {
    /// Decoded string content received so far
    String(String),
    /// Raw number text received so far
    Number(String),
    /// Raw literal text received so far
    Literal(String),
}

/// Where and why the scanner stopped
#[derive(Debug, Clone, PartialEq)]
pub struct Halt {
    /// State the automaton was in when the offending character arrived
    pub state: State,
    /// The partial token at that moment
    pub partial: Option<Partial>,
    /// Character offset of the offending character (or of end-of-input)
    pub offset: usize,
}

/// Incremental JSON scanner
#[derive(Debug, Clone)]
pub struct Scanner {
    state: State,
    /// Raw text of a number or literal in progress
    raw: String,
    /// Decoded content of a string in progress
    string: String,
    /// Hex digits of a `\u` escape in progress
    hex: String,
    /// High surrogate waiting for its low half
    high_surrogate: Option<u16>,
    halt: Option<Halt>,
    offset: usize,
    finished: bool,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner {
    pub fn new() -> Self {
        Self {
            state: State::Whitespace,
            raw: String::new(),
            string: String::new(),
            hex: String::new(),
            high_surrogate: None,
            halt: None,
            offset: 0,
            finished: false,
        }
    }

    /// Feed more characters and return the tokens they completed
    pub fn feed(&mut self, input: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        if self.finished {
            return tokens;
        }
        for c in input.chars() {
            if self.state == State::Halted {
                break;
            }
            self.step(c, &mut tokens);
            self.offset += 1;
        }
        tokens
    }

    /// Signal end-of-input: flush a trailing number or literal and emit
    /// [`Token::End`]. An unterminated string halts the scanner instead.
    pub fn finish(&mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        if self.finished {
            return tokens;
        }
        self.finished = true;
        match self.state {
            State::Halted => return tokens,
            State::Whitespace => {}
            State::IntegerZero | State::Integer | State::Fraction | State::Exponent => {
                tokens.push(self.take_number());
            }
            State::Literal(literal, matched) if usize::from(matched) == literal.text().len() => {
                self.raw.clear();
                self.state = State::Whitespace;
                tokens.push(literal.token());
            }
            _ => {
                self.halt_here();
                return tokens;
            }
        }
        tokens.push(Token::End);
        tokens
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The halt record, if the scanner hit an invalid transition
    pub fn halted(&self) -> Option<&Halt> {
        self.halt.as_ref()
    }

    /// The token currently being received, if any
    pub fn partial(&self) -> Option<Partial> {
        match self.state {
            State::String | State::StringEscape | State::Unicode(_) => {
                Some(Partial::String(self.string.clone()))
            }
            State::IntegerSign
            | State::IntegerZero
            | State::Integer
            | State::FractionStart
            | State::Fraction
            | State::ExponentStart
            | State::ExponentSign
            | State::Exponent => Some(Partial::Number(self.raw.clone())),
            State::Literal(..) => Some(Partial::Literal(self.raw.clone())),
            State::Halted => self.halt.as_ref().and_then(|h| h.partial.clone()),
            State::Whitespace => None,
        }
    }

    fn step(&mut self, c: char, out: &mut Vec<Token>) {
        match self.state {
            State::Whitespace => self.start(c, out),
            State::IntegerSign => match c {
                '0' => self.advance(c, State::IntegerZero),
                '1'..='9' => self.advance(c, State::Integer),
                _ => self.halt_here(),
            },
            State::IntegerZero => match c {
                '.' => self.advance(c, State::FractionStart),
                'e' | 'E' => self.advance(c, State::ExponentStart),
                _ if is_delimiter(c) => self.end_number(c, out),
                _ => self.halt_here(),
            },
            State::Integer => match c {
                '0'..='9' => self.raw.push(c),
                '.' => self.advance(c, State::FractionStart),
                'e' | 'E' => self.advance(c, State::ExponentStart),
                _ if is_delimiter(c) => self.end_number(c, out),
                _ => self.halt_here(),
            },
            State::FractionStart => match c {
                '0'..='9' => self.advance(c, State::Fraction),
                _ => self.halt_here(),
            },
            State::Fraction => match c {
                '0'..='9' => self.raw.push(c),
                'e' | 'E' => self.advance(c, State::ExponentStart),
                _ if is_delimiter(c) => self.end_number(c, out),
                _ => self.halt_here(),
            },
            State::ExponentStart => match c {
                '+' | '-' => self.advance(c, State::ExponentSign),
                '0'..='9' => self.advance(c, State::Exponent),
                _ => self.halt_here(),
            },
            State::ExponentSign => match c {
                '0'..='9' => self.advance(c, State::Exponent),
                _ => self.halt_here(),
            },
            State::Exponent => match c {
                '0'..='9' => self.raw.push(c),
                _ if is_delimiter(c) => self.end_number(c, out),
                _ => self.halt_here(),
            },
            State::String => match c {
                '"' => {
                    self.flush_surrogate();
                    self.state = State::Whitespace;
                    out.push(Token::String(std::mem::take(&mut self.string)));
                }
                '\\' => self.state = State::StringEscape,
                _ => {
                    self.flush_surrogate();
                    self.string.push(c);
                }
            },
            State::StringEscape => {
                let decoded = match c {
                    '"' => '"',
                    '\\' => '\\',
                    '/' => '/',
                    'b' => '\u{8}',
                    'f' => '\u{c}',
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    'u' => {
                        self.hex.clear();
                        self.state = State::Unicode(0);
                        return;
                    }
                    _ => {
                        self.halt_here();
                        return;
                    }
                };
                self.flush_surrogate();
                self.string.push(decoded);
                self.state = State::String;
            }
            State::Unicode(read) => {
                if !c.is_ascii_hexdigit() {
                    self.halt_here();
                    return;
                }
                self.hex.push(c);
                if read + 1 < 4 {
                    self.state = State::Unicode(read + 1);
                    return;
                }
                // Four ASCII hex digits always fit a u16
                let unit = u16::from_str_radix(&self.hex, 16).unwrap_or(0xFFFD);
                self.hex.clear();
                self.push_utf16(unit);
                self.state = State::String;
            }
            State::Literal(literal, matched) => {
                let text = literal.text();
                if usize::from(matched) == text.len() {
                    if is_delimiter(c) {
                        self.raw.clear();
                        out.push(literal.token());
                        self.state = State::Whitespace;
                        self.start(c, out);
                    } else {
                        self.halt_here();
                    }
                } else if text[usize::from(matched)..].starts_with(c) {
                    self.raw.push(c);
                    self.state = State::Literal(literal, matched + 1);
                } else {
                    self.halt_here();
                }
            }
            State::Halted => {}
        }
    }

    /// Handle the first character of a new token
    fn start(&mut self, c: char, out: &mut Vec<Token>) {
        match c {
            _ if c.is_whitespace() => {}
            '{' | '}' | '[' | ']' | ',' | ':' => out.push(Token::Operator(c)),
            '"' => {
                self.string.clear();
                self.state = State::String;
            }
            '-' => self.begin_raw(c, State::IntegerSign),
            '0' => self.begin_raw(c, State::IntegerZero),
            '1'..='9' => self.begin_raw(c, State::Integer),
            't' => self.begin_raw(c, State::Literal(Literal::True, 1)),
            'f' => self.begin_raw(c, State::Literal(Literal::False, 1)),
            'n' => self.begin_raw(c, State::Literal(Literal::Null, 1)),
            _ => self.halt_here(),
        }
    }

    fn begin_raw(&mut self, c: char, state: State) {
        self.raw.clear();
        self.raw.push(c);
        self.state = state;
    }

    fn advance(&mut self, c: char, state: State) {
        self.raw.push(c);
        self.state = state;
    }

    fn end_number(&mut self, delimiter: char, out: &mut Vec<Token>) {
        out.push(self.take_number());
        self.start(delimiter, out);
    }

    fn take_number(&mut self) -> Token {
        let raw = std::mem::take(&mut self.raw);
        self.state = State::Whitespace;
        let integral = !raw.contains(|c| matches!(c, '.' | 'e' | 'E'));
        if integral {
            if let Ok(value) = raw.parse::<i64>() {
                return Token::Number(Number::Integer(value));
            }
        }
        Token::Number(Number::Float(raw.parse().unwrap_or(f64::NAN)))
    }

    fn push_utf16(&mut self, unit: u16) {
        match unit {
            0xD800..=0xDBFF => {
                self.flush_surrogate();
                self.high_surrogate = Some(unit);
            }
            0xDC00..=0xDFFF => match self.high_surrogate.take() {
                Some(high) => {
                    let code = 0x10000 + ((u32::from(high) - 0xD800) << 10) + (u32::from(unit) - 0xDC00);
                    self.string.push(char::from_u32(code).unwrap_or('\u{FFFD}'));
                }
                None => self.string.push('\u{FFFD}'),
            },
            _ => {
                self.flush_surrogate();
                self.string.push(char::from_u32(u32::from(unit)).unwrap_or('\u{FFFD}'));
            }
        }
    }

    /// An unpaired high surrogate decodes to the replacement character
    fn flush_surrogate(&mut self) {
        if self.high_surrogate.take().is_some() {
            self.string.push('\u{FFFD}');
        }
    }

    fn halt_here(&mut self) {
        let partial = self.partial();
        self.halt = Some(Halt {
            state: self.state,
            partial,
            offset: self.offset,
        });
        self.state = State::Halted;
    }
}

/// Whitespace and structural operators end numbers and literals
pub fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '{' | '}' | '[' | ']' | ',' | ':')
}

/// Result of a one-shot scan over a buffer that may still be growing
#[derive(Debug, Clone, PartialEq)]
pub struct Scan {
    pub tokens: Vec<Token>,
    pub partial: Option<Partial>,
    pub halt: Option<Halt>,
}

/// Scan a buffer from scratch without treating its end as end-of-input
pub fn scan(input: &str) -> Scan {
    let mut scanner = Scanner::new();
    let tokens = scanner.feed(input);
    Scan {
        tokens,
        partial: scanner.partial(),
        halt: scanner.halted().cloned(),
    }
}

/// Scan a complete document, flushing the tail and appending [`Token::End`]
pub fn scan_complete(input: &str) -> Scan {
    let mut scanner = Scanner::new();
    let mut tokens = scanner.feed(input);
    tokens.extend(scanner.finish());
    Scan {
        tokens,
        partial: None,
        halt: scanner.halted().cloned(),
    }
}
