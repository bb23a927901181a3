use std::str::FromStr;

use rust_decimal::Decimal;

use super::ConditionParseError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum CompareOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl CompareOp {
    pub(crate) fn is_ordering(&self) -> bool {
        matches!(self, Self::Gt | Self::Ge | Self::Lt | Self::Le)
    }

    pub(crate) fn symbol(&self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Field(String),
    Number { value: Decimal, raw: String },
    Str(String),
    Ident(String),
    Compare(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
    Colon,
    Comma,
}

impl TokenKind {
    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Field(name) => format!("field `#{name}`"),
            Self::Number { raw, .. } => format!("number `{raw}`"),
            Self::Str(value) => format!("string \"{value}\""),
            Self::Ident(value) => format!("`{value}`"),
            Self::Compare(op) => format!("operator `{}`", op.symbol()),
            Self::And => "`&&`".to_string(),
            Self::Or => "`||`".to_string(),
            Self::Not => "`!`".to_string(),
            Self::LParen => "`(`".to_string(),
            Self::RParen => "`)`".to_string(),
            Self::Colon => "`:`".to_string(),
            Self::Comma => "`,`".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub position: usize,
}

pub(crate) fn tokenize(input: &str) -> Result<Vec<Token>, ConditionParseError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut index = 0;

    while index < chars.len() {
        let ch = chars[index];
        let position = index;

        if ch.is_whitespace() {
            index += 1;
            continue;
        }

        let kind = match ch {
            '(' => {
                index += 1;
                TokenKind::LParen
            }
            ')' => {
                index += 1;
                TokenKind::RParen
            }
            ':' => {
                index += 1;
                TokenKind::Colon
            }
            ',' => {
                index += 1;
                TokenKind::Comma
            }
            '#' => {
                index += 1;
                let name = take_while(&chars, &mut index, is_field_char);
                if name.is_empty() {
                    return Err(ConditionParseError::EmptyFieldName { position });
                }
                TokenKind::Field(name)
            }
            '"' | '\'' => {
                index += 1;
                let mut value = String::new();
                loop {
                    match chars.get(index) {
                        Some(next) if *next == ch => {
                            index += 1;
                            break;
                        }
                        Some(next) => {
                            value.push(*next);
                            index += 1;
                        }
                        None => return Err(ConditionParseError::UnterminatedString { position }),
                    }
                }
                TokenKind::Str(value)
            }
            '&' | '|' => {
                if chars.get(index + 1) != Some(&ch) {
                    return Err(ConditionParseError::UnexpectedCharacter { ch, position });
                }
                index += 2;
                if ch == '&' {
                    TokenKind::And
                } else {
                    TokenKind::Or
                }
            }
            '>' | '<' | '=' | '!' => {
                let followed_by_eq = chars.get(index + 1) == Some(&'=');
                index += if followed_by_eq { 2 } else { 1 };
                match (ch, followed_by_eq) {
                    ('>', true) => TokenKind::Compare(CompareOp::Ge),
                    ('>', false) => TokenKind::Compare(CompareOp::Gt),
                    ('<', true) => TokenKind::Compare(CompareOp::Le),
                    ('<', false) => TokenKind::Compare(CompareOp::Lt),
                    ('=', true) => TokenKind::Compare(CompareOp::Eq),
                    ('!', true) => TokenKind::Compare(CompareOp::Ne),
                    ('!', false) => TokenKind::Not,
                    _ => return Err(ConditionParseError::UnexpectedCharacter { ch, position }),
                }
            }
            _ if ch.is_ascii_digit() || (ch == '-' && next_is_digit(&chars, index)) => {
                let mut raw = String::new();
                if ch == '-' {
                    raw.push('-');
                    index += 1;
                }
                raw.push_str(&take_while(&chars, &mut index, |c| c.is_ascii_digit() || c == '.' || c == '_'));
                let digits = raw.replace('_', "");
                let value = Decimal::from_str(&digits)
                    .map_err(|_| ConditionParseError::InvalidNumber { raw: raw.clone(), position })?;
                TokenKind::Number { value, raw }
            }
            _ if ch.is_alphabetic() || ch == '_' => {
                let word = take_while(&chars, &mut index, |c| c.is_alphanumeric() || c == '_' || c == '-');
                match word.to_ascii_lowercase().as_str() {
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "not" => TokenKind::Not,
                    _ => TokenKind::Ident(word),
                }
            }
            _ => return Err(ConditionParseError::UnexpectedCharacter { ch, position }),
        };

        tokens.push(Token { kind, position });
    }

    Ok(tokens)
}

fn is_field_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '.'
}

fn next_is_digit(chars: &[char], index: usize) -> bool {
    chars.get(index + 1).is_some_and(|next| next.is_ascii_digit())
}

fn take_while(chars: &[char], index: &mut usize, predicate: impl Fn(char) -> bool) -> String {
    let start = *index;
    while *index < chars.len() && predicate(chars[*index]) {
        *index += 1;
    }
    chars[start..*index].iter().collect()
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{tokenize, CompareOp, TokenKind};
    use crate::condition::ConditionParseError;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input).expect("tokenize").into_iter().map(|token| token.kind).collect()
    }

    #[test]
    fn tokenizes_numeric_comparison() {
        assert_eq!(
            kinds("#amount >= 300000"),
            vec![
                TokenKind::Field("amount".to_string()),
                TokenKind::Compare(CompareOp::Ge),
                TokenKind::Number { value: Decimal::new(300_000, 0), raw: "300000".to_string() },
            ]
        );
    }

    #[test]
    fn tokenizes_membership_list() {
        assert_eq!(
            kinds("#expense_codes:ENTN,EQUM"),
            vec![
                TokenKind::Field("expense_codes".to_string()),
                TokenKind::Colon,
                TokenKind::Ident("ENTN".to_string()),
                TokenKind::Comma,
                TokenKind::Ident("EQUM".to_string()),
            ]
        );
    }

    #[test]
    fn word_operators_are_case_insensitive() {
        assert_eq!(
            kinds("#a AND NOT #b or #c"),
            vec![
                TokenKind::Field("a".to_string()),
                TokenKind::And,
                TokenKind::Not,
                TokenKind::Field("b".to_string()),
                TokenKind::Or,
                TokenKind::Field("c".to_string()),
            ]
        );
    }

    #[test]
    fn rejects_single_ampersand_and_host_syntax() {
        assert!(matches!(
            tokenize("#a & #b"),
            Err(ConditionParseError::UnexpectedCharacter { ch: '&', .. })
        ));
        assert!(matches!(
            tokenize("system(`rm -rf /`)"),
            Err(ConditionParseError::UnexpectedCharacter { ch: '`', .. })
        ));
    }

    #[test]
    fn rejects_unterminated_string() {
        assert_eq!(
            tokenize("#dept == \"sales"),
            Err(ConditionParseError::UnterminatedString { position: 9 })
        );
    }

    #[test]
    fn negative_and_underscored_numbers() {
        assert_eq!(
            kinds("-1_000.50"),
            vec![TokenKind::Number { value: Decimal::new(-100_050, 2), raw: "-1_000.50".to_string() }]
        );
    }
}
