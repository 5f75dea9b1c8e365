// Expression Lexer
// Tokenizes filter and pick expressions such as `x > -0.2 and x < 0.4`

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Null,
    True,
    False,
    Number(f64),
    String(String),

    Identifier(String),

    // Operators
    Plus,     // +
    Minus,    // -
    Star,     // *
    Slash,    // /
    Percent,  // %
    Eq,       // ==
    Ne,       // !=
    Lt,       // <
    Le,       // <=
    Gt,       // >
    Ge,       // >=
    And,      // && and
    Or,       // || or
    Not,      // ! not
    Comma,    // ,
    Colon,    // :
    Question, // ?

    LParen, // (
    RParen, // )

    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Null => write!(f, "null"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Number(n) => write!(f, "{}", n),
            Token::String(s) => write!(f, "'{}'", s),
            Token::Identifier(s) => write!(f, "{}", s),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::Question => write!(f, "?"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Eof => write!(f, "end of expression"),
        }
    }
}

/// Token with its byte offset in the source
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

#[derive(Debug, Clone)]
pub struct LexError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at position {}", self.message, self.position)
    }
}

impl std::error::Error for LexError {}

pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    len: usize,
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
            len: input.len(),
            position: 0,
        }
    }

    /// Tokenize the entire input; the last token is always `Eof`
    pub fn tokenize(&mut self) -> Result<Vec<Spanned>, LexError> {
        let mut tokens = Vec::new();

        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(Spanned {
                token,
                position: self.position,
            });
            if done {
                break;
            }
        }

        Ok(tokens)
    }

    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace();

        let Some(&(pos, ch)) = self.chars.peek() else {
            self.position = self.len;
            return Ok(Token::Eof);
        };

        self.position = pos;

        let single = match ch {
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '%' => Some(Token::Percent),
            ',' => Some(Token::Comma),
            ':' => Some(Token::Colon),
            '?' => Some(Token::Question),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            _ => None,
        };
        if let Some(token) = single {
            self.advance();
            return Ok(token);
        }

        match ch {
            '=' => {
                self.advance();
                if self.peek_char() == Some('=') {
                    self.advance();
                    Ok(Token::Eq)
                } else {
                    Err(LexError {
                        message: "expected '==', found '='".to_string(),
                        position: pos,
                    })
                }
            }
            '!' => {
                self.advance();
                Ok(self.followed_by_eq(Token::Ne, Token::Not))
            }
            '<' => {
                self.advance();
                Ok(self.followed_by_eq(Token::Le, Token::Lt))
            }
            '>' => {
                self.advance();
                Ok(self.followed_by_eq(Token::Ge, Token::Gt))
            }
            '&' => self.doubled('&', Token::And, pos),
            '|' => self.doubled('|', Token::Or, pos),

            '\'' | '"' => self.read_string(ch),

            '0'..='9' | '.' => self.read_number(),

            'a'..='z' | 'A'..='Z' | '_' => Ok(self.read_identifier()),

            _ => Err(LexError {
                message: format!("unexpected character '{}'", ch),
                position: pos,
            }),
        }
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        self.chars.next()
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn followed_by_eq(&mut self, with_eq: Token, without: Token) -> Token {
        if self.peek_char() == Some('=') {
            self.advance();
            with_eq
        } else {
            without
        }
    }

    fn doubled(&mut self, ch: char, token: Token, pos: usize) -> Result<Token, LexError> {
        self.advance();
        if self.peek_char() == Some(ch) {
            self.advance();
            Ok(token)
        } else {
            Err(LexError {
                message: format!("expected '{}{}'", ch, ch),
                position: pos,
            })
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_string(&mut self, quote: char) -> Result<Token, LexError> {
        let start = self.position;
        self.advance();

        let mut value = String::new();

        loop {
            match self.advance() {
                // A doubled quote is an escaped quote
                Some((_, c)) if c == quote => {
                    if self.peek_char() == Some(quote) {
                        value.push(quote);
                        self.advance();
                    } else {
                        break;
                    }
                }
                Some((_, c)) => value.push(c),
                None => {
                    return Err(LexError {
                        message: "unterminated string".to_string(),
                        position: start,
                    });
                }
            }
        }

        Ok(Token::String(value))
    }

    fn read_number(&mut self) -> Result<Token, LexError> {
        let start = self.position;
        let mut num_str = String::new();

        self.take_digits(&mut num_str);

        if self.peek_char() == Some('.') {
            num_str.push('.');
            self.advance();
            self.take_digits(&mut num_str);
        }

        // Exponent: 1e-3, 2.5E4
        if matches!(self.peek_char(), Some('e') | Some('E')) {
            let mut lookahead = self.chars.clone();
            lookahead.next();
            let next = lookahead.next().map(|(_, c)| c);
            let after_sign = lookahead.next().map(|(_, c)| c);
            let has_exponent = match next {
                Some(c) if c.is_ascii_digit() => true,
                Some('+') | Some('-') => after_sign.is_some_and(|c| c.is_ascii_digit()),
                _ => false,
            };
            if has_exponent {
                num_str.push('e');
                self.advance();
                if let Some(sign @ ('+' | '-')) = self.peek_char() {
                    num_str.push(sign);
                    self.advance();
                }
                self.take_digits(&mut num_str);
            }
        }

        num_str
            .parse::<f64>()
            .map(Token::Number)
            .map_err(|_| LexError {
                message: format!("invalid number '{}'", num_str),
                position: start,
            })
    }

    fn take_digits(&mut self, out: &mut String) {
        while let Some(ch) = self.peek_char() {
            if ch.is_ascii_digit() {
                out.push(ch);
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_identifier(&mut self) -> Token {
        let mut ident = String::new();

        while let Some(ch) = self.peek_char() {
            if ch.is_alphanumeric() || ch == '_' {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        match ident.to_lowercase().as_str() {
            "null" | "none" => Token::Null,
            "true" => Token::True,
            "false" => Token::False,
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            _ => Token::Identifier(ident),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str) -> Vec<Token> {
        Lexer::new(input)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn test_comparison() {
        assert_eq!(
            tokens("x > -0.2"),
            vec![
                Token::Identifier("x".to_string()),
                Token::Gt,
                Token::Minus,
                Token::Number(0.2),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_word_operators() {
        assert_eq!(
            tokens("not x and x or True"),
            vec![
                Token::Not,
                Token::Identifier("x".to_string()),
                Token::And,
                Token::Identifier("x".to_string()),
                Token::Or,
                Token::True,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_strings_with_either_quote() {
        assert_eq!(
            tokens(r#"'it''s' "say ""hi""""#),
            vec![
                Token::String("it's".to_string()),
                Token::String("say \"hi\"".to_string()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            tokens("1e-3 2.5 .5 7"),
            vec![
                Token::Number(0.001),
                Token::Number(2.5),
                Token::Number(0.5),
                Token::Number(7.0),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_identifier_followed_by_e_is_not_exponent() {
        assert_eq!(
            tokens("2 else"),
            vec![
                Token::Number(2.0),
                Token::Identifier("else".to_string()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_positions() {
        let spanned = Lexer::new("abs(x)").tokenize().unwrap();
        let positions: Vec<usize> = spanned.iter().map(|s| s.position).collect();
        assert_eq!(positions, vec![0, 3, 4, 5, 6]);
    }

    #[test]
    fn test_errors() {
        assert!(Lexer::new("x = 1").tokenize().is_err());
        assert!(Lexer::new("x & y").tokenize().is_err());
        assert!(Lexer::new("'open").tokenize().is_err());
        let err = Lexer::new("x # 1").tokenize().unwrap_err();
        assert_eq!(err.position, 2);
    }
}
