/// Substitution context for publishable topics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TopicContext<'a> {
    pub prefix: &'a str,
    pub client_id: &'a str,
    pub device_name: &'a str,
    pub value_name: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Prefix,
    ClientId,
    DeviceName,
    ValueName,
}

/// Precompiled topic template. Publishable topics accept the placeholders
/// `%Prefix%`, `%ClientId%`, `%DeviceName%` and `%ValueName%`; anything else
/// between percent signs stays literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTemplate {
    segments: Vec<Segment>,
}

impl TopicTemplate {
    pub fn compile(template: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = template;

        while let Some(start) = rest.find('%') {
            let after = &rest[start + 1..];
            match after.find('%') {
                Some(end) => {
                    let placeholder = &after[..end];
                    let segment = match placeholder {
                        "Prefix" => Some(Segment::Prefix),
                        "ClientId" => Some(Segment::ClientId),
                        "DeviceName" => Some(Segment::DeviceName),
                        "ValueName" => Some(Segment::ValueName),
                        _ => None,
                    };
                    match segment {
                        Some(segment) => {
                            literal.push_str(&rest[..start]);
                            if !literal.is_empty() {
                                segments.push(Segment::Literal(std::mem::take(&mut literal)));
                            }
                            segments.push(segment);
                            rest = &after[end + 1..];
                        }
                        None => {
                            // unknown placeholder: keep the opening percent
                            // literal and continue scanning after it
                            literal.push_str(&rest[..start + 1]);
                            rest = after;
                        }
                    }
                }
                None => break,
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Self { segments }
    }

    pub fn render(&self, ctx: &TopicContext<'_>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Prefix => out.push_str(ctx.prefix),
                Segment::ClientId => out.push_str(ctx.client_id),
                Segment::DeviceName => out.push_str(ctx.device_name),
                Segment::ValueName => out.push_str(ctx.value_name),
            }
        }
        out
    }

    /// True when the template references `%DeviceName%` or `%ValueName%`
    /// and therefore must be rendered per publish, not once per client.
    pub fn is_per_value(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::DeviceName | Segment::ValueName))
    }
}

/// Match an MQTT topic against a subscription filter with `+` and `#`
/// wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_all_placeholders() {
        let template = TopicTemplate::compile("%Prefix%stat/%DeviceName%/%ValueName%");
        let topic = template.render(&TopicContext {
            prefix: "p",
            client_id: "",
            device_name: "d",
            value_name: "r",
        });
        assert_eq!(topic, "pstat/d/r");
    }

    #[test]
    fn unknown_placeholders_stay_literal() {
        let template = TopicTemplate::compile("%Prefix%x/%Nope%/y");
        let topic = template.render(&TopicContext {
            prefix: "p/",
            ..Default::default()
        });
        assert_eq!(topic, "p/x/%Nope%/y");
    }

    #[test]
    fn per_value_detection() {
        assert!(TopicTemplate::compile("%Prefix%stat/%DeviceName%/%ValueName%").is_per_value());
        assert!(!TopicTemplate::compile("%Prefix%%ClientId%/status").is_per_value());
    }

    #[test]
    fn wildcard_matching() {
        assert!(topic_matches("stat/+/Power", "stat/bmv0/Power"));
        assert!(topic_matches("stat/#", "stat/bmv0/Power"));
        assert!(topic_matches("stat/bmv0/Power", "stat/bmv0/Power"));
        assert!(!topic_matches("stat/+/Power", "stat/bmv0/Voltage"));
        assert!(!topic_matches("stat/+", "stat/bmv0/Power"));
    }
}
