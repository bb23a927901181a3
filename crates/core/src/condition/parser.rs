use rust_decimal::Decimal;

use super::lexer::{CompareOp, Token, TokenKind};
use super::ConditionParseError;

const MAX_NESTING: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Literal {
    Number(Decimal),
    Text(String),
    Bool(bool),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Expr {
    Const(bool),
    Compare { field: String, op: CompareOp, value: Literal },
    AnyOf { field: String, codes: Vec<String> },
    Truthy(String),
    Not(Box<Expr>),
    /// Flat operand lists keep long `&&`/`||` chains at constant depth.
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

pub(crate) fn parse_tokens(tokens: &[Token]) -> Result<Expr, ConditionParseError> {
    let mut parser = Parser { tokens, index: 0, depth: 0 };
    let expr = parser.parse_or()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(unexpected(token)),
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    index: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.index)
    }

    fn next(&mut self) -> Result<&'a Token, ConditionParseError> {
        let token = self.tokens.get(self.index).ok_or(ConditionParseError::UnexpectedEnd)?;
        self.index += 1;
        Ok(token)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().is_some_and(|token| &token.kind == kind) {
            self.index += 1;
            return true;
        }
        false
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionParseError> {
        let mut terms = vec![self.parse_and()?];
        while self.eat(&TokenKind::Or) {
            terms.push(self.parse_and()?);
        }
        Ok(collapse(terms, Expr::Or))
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionParseError> {
        let mut terms = vec![self.parse_unary()?];
        while self.eat(&TokenKind::And) {
            terms.push(self.parse_unary()?);
        }
        Ok(collapse(terms, Expr::And))
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionParseError> {
        if self.eat(&TokenKind::Not) {
            self.descend()?;
            let inner = self.parse_unary();
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionParseError> {
        let token = self.next()?;
        match &token.kind {
            TokenKind::LParen => {
                self.descend()?;
                let inner = self.parse_or();
                self.depth -= 1;
                let inner = inner?;
                let closing = self.next()?;
                if closing.kind != TokenKind::RParen {
                    return Err(unexpected(closing));
                }
                Ok(inner)
            }
            TokenKind::Ident(word) if word.eq_ignore_ascii_case("true") => Ok(Expr::Const(true)),
            TokenKind::Ident(word) if word.eq_ignore_ascii_case("false") => Ok(Expr::Const(false)),
            TokenKind::Field(field) => self.parse_field_tail(field),
            _ => Err(unexpected(token)),
        }
    }

    fn parse_field_tail(&mut self, field: &str) -> Result<Expr, ConditionParseError> {
        let Some(token) = self.peek() else {
            return Ok(Expr::Truthy(field.to_string()));
        };

        match &token.kind {
            TokenKind::Compare(op) => {
                self.index += 1;
                let value = self.parse_literal()?;
                if op.is_ordering() && !matches!(value, Literal::Number(_)) {
                    return Err(ConditionParseError::NonNumericOrdering {
                        field: field.to_string(),
                        position: token.position,
                    });
                }
                Ok(Expr::Compare { field: field.to_string(), op: op.clone(), value })
            }
            TokenKind::Colon => {
                self.index += 1;
                let mut codes = vec![self.parse_code(field)?];
                while self.eat(&TokenKind::Comma) {
                    codes.push(self.parse_code(field)?);
                }
                Ok(Expr::AnyOf { field: field.to_string(), codes })
            }
            _ => Ok(Expr::Truthy(field.to_string())),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal, ConditionParseError> {
        let token = self.next()?;
        match &token.kind {
            TokenKind::Number { value, .. } => Ok(Literal::Number(*value)),
            TokenKind::Str(value) => Ok(Literal::Text(value.clone())),
            TokenKind::Ident(word) if word.eq_ignore_ascii_case("true") => Ok(Literal::Bool(true)),
            TokenKind::Ident(word) if word.eq_ignore_ascii_case("false") => {
                Ok(Literal::Bool(false))
            }
            TokenKind::Ident(word) => Ok(Literal::Text(word.clone())),
            _ => Err(unexpected(token)),
        }
    }

    fn parse_code(&mut self, field: &str) -> Result<String, ConditionParseError> {
        match self.peek().map(|token| &token.kind) {
            Some(TokenKind::Ident(code)) | Some(TokenKind::Str(code)) => {
                self.index += 1;
                Ok(code.clone())
            }
            Some(TokenKind::Number { raw, .. }) => {
                self.index += 1;
                Ok(raw.clone())
            }
            _ => Err(ConditionParseError::EmptyMembershipList { field: field.to_string() }),
        }
    }

    fn descend(&mut self) -> Result<(), ConditionParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(ConditionParseError::TooDeeplyNested { limit: MAX_NESTING });
        }
        Ok(())
    }
}

fn unexpected(token: &Token) -> ConditionParseError {
    ConditionParseError::UnexpectedToken {
        found: token.kind.describe(),
        position: token.position,
    }
}

fn collapse(mut terms: Vec<Expr>, join: fn(Vec<Expr>) -> Expr) -> Expr {
    if terms.len() == 1 {
        if let Some(only) = terms.pop() {
            return only;
        }
    }
    join(terms)
}
