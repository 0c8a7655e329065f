//! CoRE Link Format 的最小解析与渲染。
//!
//! 用于三处：资源发现列表、POST 建主题时的建议名（`<name>;ct=0`）、资源目录注册报文。
//! 仅支持 `<target>;attr;attr=token;attr="quoted"` 以逗号分隔的形式，不做 URI 引用解析。

use std::{borrow::ToOwned, string::String, vec::Vec};

use crate::{core::message::ContentFormat, error::BrokerError};

/// 单条链接。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Link {
    target: String,
    attrs: Vec<(String, Option<String>)>,
}

impl Link {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            attrs: Vec::new(),
        }
    }

    /// 追加 `name=value` 属性。
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((name.into(), Some(value.into())));
        self
    }

    /// 追加无值属性（如 `obs`）。
    pub fn with_flag(mut self, name: impl Into<String>) -> Self {
        self.attrs.push((name.into(), None));
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.attrs
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_deref()))
    }

    /// 首个同名属性的值；无值属性返回 `Some("")`。
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    /// 属性值按空白拆分后的全部取值，`rt="a b"` 与 `rt=a;rt=b` 等价。
    pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.attrs
            .iter()
            .filter(move |(n, _)| n == name)
            .filter_map(|(_, v)| v.as_deref())
            .flat_map(str::split_whitespace)
    }

    /// 解析 `ct` 属性。
    pub fn content_format(&self) -> Result<Option<ContentFormat>, BrokerError> {
        match self.attr("ct") {
            None => Ok(None),
            Some(raw) => raw
                .parse::<u16>()
                .map(|value| Some(ContentFormat(value)))
                .map_err(|_| BrokerError::validation(format!("invalid ct value `{raw}`"))),
        }
    }
}

/// 解析链接列表；空输入得到空列表。
pub fn parse(input: &str) -> Result<Vec<Link>, BrokerError> {
    let mut links = Vec::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let after_open = rest
            .strip_prefix('<')
            .ok_or_else(|| BrokerError::validation("link must start with `<`"))?;
        let close = after_open
            .find('>')
            .ok_or_else(|| BrokerError::validation("unterminated link target"))?;
        let mut link = Link::new(&after_open[..close]);
        rest = &after_open[close + 1..];

        loop {
            rest = rest.trim_start();
            let Some(after_semi) = rest.strip_prefix(';') else {
                break;
            };
            rest = after_semi.trim_start();
            if rest.is_empty() || rest.starts_with([';', ',']) {
                continue;
            }
            let name_end = rest.find(['=', ';', ',']).unwrap_or(rest.len());
            let name = rest[..name_end].trim();
            if name.is_empty() {
                return Err(BrokerError::validation("empty link attribute name"));
            }
            rest = &rest[name_end..];
            let value = match rest.strip_prefix('=') {
                Some(after_eq) => {
                    if let Some(quoted) = after_eq.strip_prefix('"') {
                        let end = quoted.find('"').ok_or_else(|| {
                            BrokerError::validation("unterminated quoted attribute value")
                        })?;
                        rest = &quoted[end + 1..];
                        Some(quoted[..end].to_owned())
                    } else {
                        let end = after_eq.find([';', ',']).unwrap_or(after_eq.len());
                        rest = &after_eq[end..];
                        Some(after_eq[..end].trim().to_owned())
                    }
                }
                None => None,
            };
            link.attrs.push((name.to_owned(), value));
        }

        links.push(link);
        rest = rest.trim_start();
        if let Some(after_comma) = rest.strip_prefix(',') {
            rest = after_comma.trim_start();
        } else if !rest.is_empty() {
            return Err(BrokerError::validation(format!(
                "unexpected trailing input `{rest}`"
            )));
        }
    }
    Ok(links)
}

/// 渲染链接列表。纯数字属性值不加引号，其余加引号。
pub fn render<'a>(links: impl IntoIterator<Item = &'a Link>) -> String {
    let mut out = String::new();
    for (idx, link) in links.into_iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        out.push('<');
        out.push_str(&link.target);
        out.push('>');
        for (name, value) in &link.attrs {
            out.push(';');
            out.push_str(name);
            if let Some(value) = value {
                out.push('=');
                if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
                    out.push_str(value);
                } else {
                    out.push('"');
                    out.push_str(value);
                    out.push('"');
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_topic_creation_payload() {
        let links = parse("<temperature>;ct=0;").expect("payload must parse");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].target(), "temperature");
        assert_eq!(links[0].content_format(), Ok(Some(ContentFormat(0))));
    }

    #[test]
    fn parses_quoted_values_with_commas() {
        let links = parse(r#"</s/t>;rt="temp, indoor";obs,</s/h>;if=sensor"#).expect("links");
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].attr("rt"), Some("temp, indoor"));
        assert_eq!(links[0].attr("obs"), Some(""));
        assert_eq!(links[1].attr("if"), Some("sensor"));
    }

    #[test]
    fn values_split_on_whitespace() {
        let links = parse(r#"</s>;rt="a b";rt=c"#).expect("links");
        let values: Vec<_> = links[0].values("rt").collect();
        assert_eq!(values, ["a", "b", "c"]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("temperature").is_err());
        assert!(parse("<t").is_err());
        assert!(parse("<t> junk").is_err());
    }

    #[test]
    fn render_quotes_non_numeric_values() {
        let link = Link::new("/ps").with_attr("ct", "40").with_attr("rt", "core.ps").with_flag("obs");
        assert_eq!(render([&link]), r#"</ps>;ct=40;rt="core.ps";obs"#);
    }
}
