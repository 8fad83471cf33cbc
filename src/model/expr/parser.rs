//! Lexer and precedence-climbing parser of formulas.
use std::fmt;

use super::{BinaryOp, Expr, ParseError};

// binding power of a leading minus: looser than '^', tighter than '*'
const PREFIX: u8 = 9;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Num(f64),
    Ident(String),
    Op(BinaryOp),
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Num(v) => write!(f, "number {}", v),
            Token::Ident(name) => write!(f, "name '{}'", name),
            Token::Op(op) => write!(f, "'{}'", op),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::Comma => write!(f, "','"),
        }
    }
}

impl BinaryOp {
    /// Left and right binding power; `^` is right associative
    fn binding(self) -> (u8, u8) {
        match self {
            BinaryOp::Eq | BinaryOp::Ne => (1, 2),
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => (3, 4),
            BinaryOp::Add | BinaryOp::Sub => (5, 6),
            BinaryOp::Mul | BinaryOp::Div => (7, 8),
            BinaryOp::Pow => (12, 11),
        }
    }
}

/// Split a formula into tokens, each with its character offset
pub fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ParseError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let start = i;
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || c == '.' {
            while i < chars.len() {
                let d = chars[i];
                let exponent_sign = (d == '+' || d == '-') && matches!(chars[i - 1], 'e' | 'E');
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                    i += 1;
                } else {
                    break;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| ParseError::new(start, format!("malformed number '{}'", text)))?;
            tokens.push((start, Token::Num(value)));
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push((start, Token::Ident(chars[start..i].iter().collect())));
            continue;
        }

        let next_is_eq = chars.get(i + 1) == Some(&'=');
        let (token, width) = match c {
            '(' => (Token::LParen, 1),
            ')' => (Token::RParen, 1),
            ',' => (Token::Comma, 1),
            '+' => (Token::Op(BinaryOp::Add), 1),
            '-' => (Token::Op(BinaryOp::Sub), 1),
            '*' => (Token::Op(BinaryOp::Mul), 1),
            '/' => (Token::Op(BinaryOp::Div), 1),
            '^' => (Token::Op(BinaryOp::Pow), 1),
            '<' if next_is_eq => (Token::Op(BinaryOp::Le), 2),
            '<' => (Token::Op(BinaryOp::Lt), 1),
            '>' if next_is_eq => (Token::Op(BinaryOp::Ge), 2),
            '>' => (Token::Op(BinaryOp::Gt), 1),
            '=' if next_is_eq => (Token::Op(BinaryOp::Eq), 2),
            '!' if next_is_eq => (Token::Op(BinaryOp::Ne), 2),
            other => {
                return Err(ParseError::new(start, format!("unexpected character '{}'", other)));
            }
        };
        tokens.push((start, token));
        i += width;
    }
    Ok(tokens)
}

pub struct Parser {
    tokens: Vec<(usize, Token)>,
    next: usize,
    end: usize,
}

impl Parser {
    pub fn new(source: &str) -> Result<Self, ParseError> {
        Ok(Parser {
            tokens: tokenize(source)?,
            next: 0,
            end: source.chars().count(),
        })
    }

    /// Parse one expression that spans every token
    pub fn parse(mut self) -> Result<Expr, ParseError> {
        let expr = self.expression(0)?;
        match self.tokens.get(self.next) {
            None => Ok(expr),
            Some((pos, token)) => Err(ParseError::new(
                *pos,
                format!("unexpected {} after a complete expression", token),
            )),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.next).map(|(_, token)| token)
    }

    fn bump(&mut self) -> Option<(usize, Token)> {
        let token = self.tokens.get(self.next).cloned();
        if token.is_some() {
            self.next += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.next += 1;
            true
        } else {
            false
        }
    }

    fn position(&self) -> usize {
        self.tokens.get(self.next).map_or(self.end, |(pos, _)| *pos)
    }

    fn expect(&mut self, token: &Token) -> Result<(), ParseError> {
        if self.eat(token) {
            return Ok(());
        }
        let found = self
            .peek()
            .map_or_else(|| "end of formula".to_string(), |t| t.to_string());
        Err(ParseError::new(
            self.position(),
            format!("expected {}, found {}", token, found),
        ))
    }

    fn expression(&mut self, min: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.operand()?;
        while let Some(&Token::Op(op)) = self.peek() {
            let (left, right) = op.binding();
            if left < min {
                break;
            }
            self.next += 1;
            let rhs = self.expression(right)?;
            lhs = Expr::Binary {
                lhs: Box::new(lhs),
                op,
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn operand(&mut self) -> Result<Expr, ParseError> {
        let end = self.end;
        match self.bump() {
            Some((_, Token::Num(value))) => Ok(Expr::Number(value)),
            Some((_, Token::Ident(name))) => {
                if self.eat(&Token::LParen) {
                    let args = self.arguments()?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some((_, Token::LParen)) => {
                let inner = self.expression(0)?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some((_, Token::Op(BinaryOp::Sub))) => Ok(Expr::Neg(Box::new(self.expression(PREFIX)?))),
            Some((_, Token::Op(BinaryOp::Add))) => self.expression(PREFIX),
            Some((pos, token)) => Err(ParseError::new(
                pos,
                format!("expected a number, a name or '(', found {}", token),
            )),
            None => Err(ParseError::new(end, "unexpected end of formula")),
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expression(0)?);
            if !self.eat(&Token::Comma) {
                self.expect(&Token::RParen)?;
                return Ok(args);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_character_operators() {
        let tokens: Vec<Token> = tokenize("a<=b!=c").unwrap().into_iter().map(|(_, t)| t).collect();
        assert_eq!(tokens[1], Token::Op(BinaryOp::Le));
        assert_eq!(tokens[3], Token::Op(BinaryOp::Ne));
        assert!(tokenize("a = b").is_err());
    }

    #[test]
    fn errors_point_at_the_offending_character() {
        let err = Expr::parse("Cl / $V").unwrap_err();
        assert_eq!(err.pos, 5);
        let err = Expr::parse("exp(a, ").unwrap_err();
        assert_eq!(err.pos, 7);
        assert!(err.to_string().contains("end of formula"));
    }
}
