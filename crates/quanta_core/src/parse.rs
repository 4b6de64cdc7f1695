use crate::error::{Error, Result};
use crate::model::EquationSet;
use crate::node::{BinaryOp, Function, NodeId, UnaryOp};
use crate::value::{parse_matrix, Value};

/// Parses an infix expression into `set`'s arena and returns the root.
///
/// Identifiers that are not followed by `(` become variable references;
/// unknown variables are created on the fly. Calls accept positional
/// operands followed by `key=value` keywords.
pub fn parse_into(set: &mut EquationSet, input: &str) -> Result<NodeId> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        set,
    };
    let root = parser.parse_expression()?;
    if let Some(token) = parser.peek() {
        return Err(Error::Parse(format!("unexpected trailing {token:?}")));
    }
    Ok(root)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Text(String),
    Matrix(String),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Ampersand,
    AndAnd,
    OrOr,
    Bang,
    Assign,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Quote,
    Comma,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                let exponent_sign = (d == '-' || d == '+')
                    && num_str.ends_with(|e: char| e == 'e' || e == 'E');
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                    num_str.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| Error::Parse(format!("bad number {num_str}")))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' || c == '$' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' || d == '$' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else if c == '"' {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some(d) => text.push(d),
                    None => return Err(Error::Parse("unterminated string".to_string())),
                }
            }
            tokens.push(Token::Text(text));
        } else if c == '[' {
            chars.next();
            let mut body = String::new();
            loop {
                match chars.next() {
                    Some(']') => break,
                    Some(d) => body.push(d),
                    None => return Err(Error::Parse("unterminated matrix".to_string())),
                }
            }
            tokens.push(Token::Matrix(body));
        } else {
            chars.next();
            let next = chars.peek().copied();
            let doubled = |second: char, double: Token, single: Token| {
                if next == Some(second) {
                    (double, true)
                } else {
                    (single, false)
                }
            };
            let (token, consumed) = match c {
                '+' => (Token::Plus, false),
                '-' => (Token::Minus, false),
                '*' => (Token::Star, false),
                '/' => (Token::Slash, false),
                '%' => (Token::Percent, false),
                '^' => (Token::Caret, false),
                '\'' => (Token::Quote, false),
                ',' => (Token::Comma, false),
                '(' => (Token::LParen, false),
                ')' => (Token::RParen, false),
                '&' => doubled('&', Token::AndAnd, Token::Ampersand),
                '=' => doubled('=', Token::Equal, Token::Assign),
                '!' => doubled('=', Token::NotEqual, Token::Bang),
                '<' => doubled('=', Token::LessEqual, Token::Less),
                '>' => doubled('=', Token::GreaterEqual, Token::Greater),
                '|' if next == Some('|') => (Token::OrOr, true),
                other => return Err(Error::Parse(format!("unexpected character {other:?}"))),
            };
            if consumed {
                chars.next();
            }
            tokens.push(token);
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    set: &'a mut EquationSet,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).cloned()
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn consume(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.consume() {
            Some(t) if t == expected => Ok(()),
            other => Err(Error::Parse(format!("expected {expected:?}, got {other:?}"))),
        }
    }

    fn parse_expression(&mut self) -> Result<NodeId> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<NodeId> {
        let mut left = self.parse_and()?;
        while let Some(Token::OrOr) = self.peek() {
            self.consume();
            let right = self.parse_and()?;
            left = self.set.arena.binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<NodeId> {
        let mut left = self.parse_comparison()?;
        while let Some(Token::AndAnd) = self.peek() {
            self.consume();
            let right = self.parse_comparison()?;
            left = self.set.arena.binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<NodeId> {
        let mut left = self.parse_term()?;
        while let Some(token) = self.peek() {
            let op = match token {
                Token::Equal => BinaryOp::Equal,
                Token::NotEqual => BinaryOp::NotEqual,
                Token::Less => BinaryOp::Less,
                Token::LessEqual => BinaryOp::LessEqual,
                Token::Greater => BinaryOp::Greater,
                Token::GreaterEqual => BinaryOp::GreaterEqual,
                _ => break,
            };
            self.consume();
            let right = self.parse_term()?;
            left = self.set.arena.binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<NodeId> {
        let mut left = self.parse_factor()?;
        while let Some(token) = self.peek() {
            let op = match token {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Subtract,
                _ => break,
            };
            self.consume();
            let right = self.parse_factor()?;
            left = self.set.arena.binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<NodeId> {
        let mut left = self.parse_unary()?;
        while let Some(token) = self.peek() {
            let op = match token {
                Token::Star => BinaryOp::Multiply,
                Token::Slash => BinaryOp::Divide,
                Token::Percent => BinaryOp::Modulo,
                Token::Ampersand => BinaryOp::MultiplyElementwise,
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = self.set.arena.binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<NodeId> {
        match self.peek() {
            Some(Token::Minus) => {
                self.consume();
                let operand = self.parse_unary()?;
                Ok(self.set.arena.unary(UnaryOp::Negate, operand))
            }
            Some(Token::Bang) => {
                self.consume();
                let operand = self.parse_unary()?;
                Ok(self.set.arena.unary(UnaryOp::Not, operand))
            }
            _ => self.parse_power(),
        }
    }

    /// Right-associative, binding tighter than unary minus on its left:
    /// `-x^2` is `-(x^2)`.
    fn parse_power(&mut self) -> Result<NodeId> {
        let base = self.parse_postfix()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(self.set.arena.binary(BinaryOp::Power, base, exponent));
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> Result<NodeId> {
        let mut operand = self.parse_primary()?;
        while let Some(Token::Quote) = self.peek() {
            self.consume();
            operand = self.set.arena.unary(UnaryOp::Transpose, operand);
        }
        Ok(operand)
    }

    fn parse_primary(&mut self) -> Result<NodeId> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(self.set.arena.constant(n)),
            Some(Token::Text(s)) => Ok(self.set.arena.constant(Value::Text(s))),
            Some(Token::Matrix(body)) => {
                let matrix = parse_matrix(&body)?;
                Ok(self.set.arena.constant(Value::Matrix(matrix)))
            }
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    self.parse_call(name)
                } else {
                    let id = self.set.add_variable(&name);
                    Ok(self.set.arena.variable(id))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            other => Err(Error::Parse(format!("unexpected token {other:?}"))),
        }
    }

    fn parse_call(&mut self, name: String) -> Result<NodeId> {
        let mut operands = Vec::new();
        let mut keywords = Vec::new();
        if let Some(Token::RParen) = self.peek() {
            self.consume();
        } else {
            loop {
                let keyword = match (self.peek(), self.peek_at(1)) {
                    (Some(Token::Identifier(key)), Some(Token::Assign)) => Some(key),
                    _ => None,
                };
                if let Some(key) = keyword {
                    self.pos += 2;
                    keywords.push((key, self.parse_expression()?));
                } else {
                    if !keywords.is_empty() {
                        return Err(Error::Parse(format!(
                            "positional operand after keyword in {name}"
                        )));
                    }
                    operands.push(self.parse_expression()?);
                }
                match self.consume() {
                    Some(Token::Comma) => continue,
                    Some(Token::RParen) => break,
                    other => {
                        return Err(Error::Parse(format!(
                            "expected ',' or ')' in {name}, got {other:?}"
                        )))
                    }
                }
            }
        }

        let id = if name == "pow" {
            if operands.len() != 2 {
                return Err(Error::Arity {
                    name,
                    expected: "2".to_string(),
                    found: operands.len(),
                });
            }
            self.set
                .arena
                .binary(BinaryOp::Power, operands[0], operands[1])
        } else {
            let function =
                Function::from_name(&name).ok_or_else(|| Error::UnknownFunction(name.clone()))?;
            let (min, max) = function.arity();
            if operands.len() < min || operands.len() > max {
                let expected = if max == usize::MAX {
                    format!("at least {min}")
                } else if min == max {
                    format!("{min}")
                } else {
                    format!("{min} to {max}")
                };
                return Err(Error::Arity {
                    name,
                    expected,
                    found: operands.len(),
                });
            }
            self.set.arena.call(function, operands)
        };
        for (key, value) in keywords {
            self.set.arena.set_keyword(id, key, value);
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Op;

    fn parse(set: &mut EquationSet, text: &str) -> NodeId {
        parse_into(set, text).expect("expression should parse")
    }

    #[test]
    fn precedence_follows_arithmetic() {
        let mut set = EquationSet::new("m");
        let root = parse(&mut set, "1 + 2 * 3 ^ 2");
        assert_eq!(set.arena.node(root).op, Op::Binary(BinaryOp::Add));
        let right = set.arena.operands(root)[1];
        assert_eq!(set.arena.node(right).op, Op::Binary(BinaryOp::Multiply));
    }

    #[test]
    fn unary_minus_binds_looser_than_power() {
        let mut set = EquationSet::new("m");
        let root = parse(&mut set, "-x^2");
        assert_eq!(set.arena.node(root).op, Op::Unary(UnaryOp::Negate));
    }

    #[test]
    fn calls_take_keywords() {
        let mut set = EquationSet::new("m");
        let root = parse(&mut set, "draw(\"out.png\", x, y, width=640, hold=1)");
        let node = set.arena.node(root);
        assert_eq!(node.function(), Some(Function::Draw));
        assert_eq!(node.operands.len(), 3);
        assert!(set.arena.keyword(root, "width").is_some());
        assert!(set.arena.keyword(root, "hold").is_some());
    }

    #[test]
    fn pow_maps_to_power_operator() {
        let mut set = EquationSet::new("m");
        let root = parse(&mut set, "pow(x, 1)");
        assert_eq!(set.arena.node(root).op, Op::Binary(BinaryOp::Power));
    }

    #[test]
    fn comparisons_and_logic() {
        let mut set = EquationSet::new("m");
        let root = parse(&mut set, "a < 1 && !(b >= 2) || c != 3");
        assert_eq!(set.arena.node(root).op, Op::Binary(BinaryOp::Or));
    }

    #[test]
    fn matrix_literals_and_transpose() {
        let mut set = EquationSet::new("m");
        let root = parse(&mut set, "[1,2;3,4]'");
        assert_eq!(set.arena.node(root).op, Op::Unary(UnaryOp::Transpose));
        let literal = set.arena.operands(root)[0];
        let shape = set
            .arena
            .node(literal)
            .constant()
            .and_then(Value::as_matrix)
            .map(|m| m.shape());
        assert_eq!(shape, Some((2, 2)));
    }

    #[test]
    fn scientific_notation() {
        let mut set = EquationSet::new("m");
        let root = parse(&mut set, "1.5e-3");
        assert_eq!(set.arena.scalar_constant(root), Some(1.5e-3));
    }

    #[test]
    fn rejects_bad_input() {
        let mut set = EquationSet::new("m");
        assert!(matches!(parse_into(&mut set, "frob(1)"), Err(Error::UnknownFunction(_))));
        assert!(matches!(parse_into(&mut set, "tanh(1, 2)"), Err(Error::Arity { .. })));
        assert!(matches!(parse_into(&mut set, "1 +"), Err(Error::Parse(_))));
        assert!(matches!(parse_into(&mut set, "(1"), Err(Error::Parse(_))));
    }
}
