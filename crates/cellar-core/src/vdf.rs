//! Minimal reader for `compatibilitytool.vdf` descriptors. Only the pieces
//! the inventory needs are understood: the tool's internal name (the first
//! key under `compatibilitytools` → `compat_tools`) and its `display_name`.

use std::{fs, io, path::Path};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ToolDescriptor {
    pub(crate) internal_name: String,
    pub(crate) display_name: String,
}

pub(crate) fn read_descriptor(path: &Path) -> io::Result<Option<ToolDescriptor>> {
    let raw = fs::read_to_string(path)?;
    Ok(parse_descriptor(&raw))
}

enum Token {
    Str(String),
    Open,
    Close,
}

fn parse_descriptor(raw: &str) -> Option<ToolDescriptor> {
    let mut stack: Vec<String> = Vec::new();
    let mut pending: Option<String> = None;
    let mut internal: Option<String> = None;
    let mut display: Option<String> = None;

    for token in tokenize(raw) {
        match token {
            Token::Open => {
                let name = pending.take()?;
                if stack.len() == 2
                    && internal.is_none()
                    && stack[0].eq_ignore_ascii_case("compatibilitytools")
                    && stack[1].eq_ignore_ascii_case("compat_tools")
                {
                    internal = Some(name.clone());
                }
                stack.push(name);
            }
            Token::Close => {
                stack.pop();
                pending = None;
            }
            Token::Str(value) => match pending.take() {
                Some(key) => {
                    let in_tool_block = stack.len() == 3
                        && internal.as_deref() == Some(stack[2].as_str());
                    if in_tool_block && display.is_none() && key.eq_ignore_ascii_case("display_name")
                    {
                        display = Some(value);
                    }
                }
                None => pending = Some(value),
            },
        }
    }

    let internal_name = internal?;
    let display_name = display.unwrap_or_else(|| internal_name.clone());
    Some(ToolDescriptor {
        internal_name,
        display_name,
    })
}

fn tokenize(raw: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                let mut value = String::new();
                while let Some(next) = chars.next() {
                    match next {
                        '"' => break,
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        other => value.push(other),
                    }
                }
                tokens.push(Token::Str(value));
            }
            '{' => tokens.push(Token::Open),
            '}' => tokens.push(Token::Close),
            '/' if chars.peek() == Some(&'/') => {
                while let Some(&next) = chars.peek() {
                    if next == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            _ => {}
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
"compatibilitytools"
{
  "compat_tools"
  {
    "GE-Proton9-1" // internal name
    {
      "install_path" "."
      "display_name" "GE-Proton 9-1"
      "from_oslist" "windows"
      "to_oslist" "linux"
    }
  }
}
"#;

    #[test]
    fn parses_internal_and_display_name() {
        let descriptor = parse_descriptor(SAMPLE).expect("descriptor");
        assert_eq!(descriptor.internal_name, "GE-Proton9-1");
        assert_eq!(descriptor.display_name, "GE-Proton 9-1");
    }

    #[test]
    fn display_name_falls_back_to_internal_name() {
        let raw = r#""compatibilitytools" { "compat_tools" { "Tool-X" { "install_path" "." } } }"#;
        let descriptor = parse_descriptor(raw).expect("descriptor");
        assert_eq!(descriptor.internal_name, "Tool-X");
        assert_eq!(descriptor.display_name, "Tool-X");
    }

    #[test]
    fn garbage_yields_none() {
        assert!(parse_descriptor("not a descriptor at all").is_none());
        assert!(parse_descriptor("").is_none());
        assert!(parse_descriptor(r#""something" { "else" { } }"#).is_none());
    }
}
