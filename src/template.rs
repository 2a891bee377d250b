use std::collections::HashMap;

use crate::error::TemplateError;

/// Values available to `{name}` placeholders for one tool launch.
#[derive(Debug, Clone, Default)]
pub struct Variables(HashMap<String, String>);

impl Variables {
    pub fn new(ip: &str, hostname: &str, output_dir: &str) -> Self {
        let mut vars = Self::default();
        vars.set("ip", ip);
        vars.set("hostname", hostname);
        vars.set("output_dir", output_dir);
        vars
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Replaces every `{key}` in `template`. `{{` and `}}` produce literal braces.
    pub fn substitute(&self, template: &str) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.char_indices().peekable();

        while let Some((offset, c)) = chars.next() {
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    out.push('{');
                }
                '{' => {
                    let start = offset + 1;
                    let end = loop {
                        match chars.next() {
                            Some((i, '}')) => break i,
                            Some((_, '{')) | None => {
                                return Err(TemplateError::Unbalanced {
                                    template: template.to_string(),
                                    offset,
                                })
                            }
                            Some(_) => {}
                        }
                    };
                    let key = &template[start..end];
                    let value = self
                        .get(key)
                        .ok_or_else(|| TemplateError::MissingVariable(key.to_string()))?;
                    out.push_str(value);
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    out.push('}');
                }
                '}' => {
                    return Err(TemplateError::Unbalanced {
                        template: template.to_string(),
                        offset,
                    })
                }
                c => out.push(c),
            }
        }

        Ok(out)
    }
}
