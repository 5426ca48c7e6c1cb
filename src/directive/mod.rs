pub mod executor;

use rust_decimal::Decimal;
use std::str::FromStr;

/// One parsed inline command extracted from raw model output.
///
/// The protocol is `[TAG]`, `[TAG:arg]` or `[TAG:arg1:arg2]`, with an
/// optional `ACTION:` prefix before the tag. Trailing string arguments may
/// themselves contain colons; they are joined back together.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Remark { name: String },
    Status { text: String },
    AvatarChange,
    AppRedirect { target: String },
    Transfer { amount: Decimal },
    RedPacket { amount: Decimal, note: Option<String> },
    PayForMe { amount: Decimal },
    FamilyCard { limit: Decimal },
    OrderFood { item: String, price: Decimal },
    InviteGroup { name: String },
    CreateGroup { name: String, members: Vec<String> },
    Emoji { id: String },
    Recall,
    Like { moment_id: String },
    Comment { moment_id: String, text: String },
}

/// Output of one scanner pass: literal text runs interleaved with parsed
/// directives, in source order. Unknown and malformed markers stay inside
/// the text runs byte-for-byte.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Directive(Directive),
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub segments: Vec<Segment>,
    /// Markers that matched a known tag but carried a bad argument, with
    /// the reason. They remain in the text; effects are skipped.
    pub malformed: Vec<(String, String)>,
}

impl ScanOutcome {
    pub fn directives(&self) -> impl Iterator<Item = &Directive> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Directive(d) => Some(d),
            Segment::Text(_) => None,
        })
    }

    /// The display text with every recognized marker stripped.
    pub fn clean_text(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            if let Segment::Text(text) = segment {
                out.push_str(text);
            }
        }
        out
    }
}

enum ParseAttempt {
    Parsed(Directive),
    Unknown,
    Malformed(String),
}

/// Single left-to-right pass over the completion. Square brackets do not
/// nest; an unterminated `[` is ordinary text.
pub fn scan(text: &str) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();
    let mut buffer = String::new();
    let mut rest = text;

    while let Some(open) = rest.find('[') {
        let (before, from_open) = rest.split_at(open);
        buffer.push_str(before);

        let Some(close) = from_open.find(']') else {
            buffer.push_str(from_open);
            rest = "";
            break;
        };

        let marker = &from_open[..=close];
        let body = &from_open[1..close];

        match parse_marker(body) {
            ParseAttempt::Parsed(directive) => {
                if !buffer.is_empty() {
                    outcome.segments.push(Segment::Text(std::mem::take(&mut buffer)));
                }
                outcome.segments.push(Segment::Directive(directive));
            }
            ParseAttempt::Unknown => {
                buffer.push_str(marker);
            }
            ParseAttempt::Malformed(reason) => {
                tracing::warn!(marker, %reason, "skipping malformed directive");
                outcome.malformed.push((marker.to_string(), reason));
                buffer.push_str(marker);
            }
        }

        rest = &from_open[close + 1..];
    }

    buffer.push_str(rest);
    if !buffer.is_empty() {
        outcome.segments.push(Segment::Text(buffer));
    }

    outcome
}

fn parse_marker(body: &str) -> ParseAttempt {
    let mut parts: Vec<&str> = body.split(':').collect();
    if parts.len() > 1 && parts[0] == "ACTION" {
        parts.remove(0);
    }

    let tag = parts[0];
    let args = &parts[1..];

    match tag {
        "REMARK" => one_string(args).map_or(ParseAttempt::Malformed("missing name".into()), |name| {
            ParseAttempt::Parsed(Directive::Remark { name })
        }),
        "STATUS" => joined_string(args)
            .map_or(ParseAttempt::Malformed("missing text".into()), |text| {
                ParseAttempt::Parsed(Directive::Status { text })
            }),
        "AVATAR_CHANGE" => {
            if args.is_empty() {
                ParseAttempt::Parsed(Directive::AvatarChange)
            } else {
                ParseAttempt::Malformed("takes no arguments".into())
            }
        }
        "APP" => one_string(args).map_or(ParseAttempt::Malformed("missing target".into()), |target| {
            ParseAttempt::Parsed(Directive::AppRedirect { target })
        }),
        "TRANSFER" => match one_decimal(args) {
            Ok(amount) => ParseAttempt::Parsed(Directive::Transfer { amount }),
            Err(reason) => ParseAttempt::Malformed(reason),
        },
        "REDPACKET" => {
            if args.is_empty() {
                return ParseAttempt::Malformed("missing amount".into());
            }
            match parse_decimal(args[0]) {
                Ok(amount) => {
                    let note = joined_string(&args[1..]);
                    ParseAttempt::Parsed(Directive::RedPacket { amount, note })
                }
                Err(reason) => ParseAttempt::Malformed(reason),
            }
        }
        "PAYFORME" => match one_decimal(args) {
            Ok(amount) => ParseAttempt::Parsed(Directive::PayForMe { amount }),
            Err(reason) => ParseAttempt::Malformed(reason),
        },
        "FAMILYCARD" => match one_decimal(args) {
            Ok(limit) => ParseAttempt::Parsed(Directive::FamilyCard { limit }),
            Err(reason) => ParseAttempt::Malformed(reason),
        },
        "ORDERFOOD" => {
            if args.len() < 2 {
                return ParseAttempt::Malformed("expected item and price".into());
            }
            let item = args[..args.len() - 1].join(":");
            match parse_decimal(args[args.len() - 1]) {
                Ok(price) if !item.trim().is_empty() => {
                    ParseAttempt::Parsed(Directive::OrderFood { item, price })
                }
                Ok(_) => ParseAttempt::Malformed("empty item".into()),
                Err(reason) => ParseAttempt::Malformed(reason),
            }
        }
        "INVITE_GROUP" => one_string(args)
            .map_or(ParseAttempt::Malformed("missing group name".into()), |name| {
                ParseAttempt::Parsed(Directive::InviteGroup { name })
            }),
        "CREATE_GROUP" => {
            if args.is_empty() || args[0].trim().is_empty() {
                return ParseAttempt::Malformed("missing group name".into());
            }
            let name = args[0].to_string();
            let members = args[1..]
                .join(":")
                .split([',', '、'])
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect();
            ParseAttempt::Parsed(Directive::CreateGroup { name, members })
        }
        "EMOJI" => one_string(args).map_or(ParseAttempt::Malformed("missing id".into()), |id| {
            ParseAttempt::Parsed(Directive::Emoji { id })
        }),
        "RECALL" => {
            if args.is_empty() {
                ParseAttempt::Parsed(Directive::Recall)
            } else {
                ParseAttempt::Malformed("takes no arguments".into())
            }
        }
        "LIKE" => one_string(args)
            .map_or(ParseAttempt::Malformed("missing moment id".into()), |moment_id| {
                ParseAttempt::Parsed(Directive::Like { moment_id })
            }),
        "COMMENT" => {
            if args.len() < 2 {
                return ParseAttempt::Malformed("expected moment id and text".into());
            }
            let moment_id = args[0].to_string();
            let text = args[1..].join(":");
            if moment_id.trim().is_empty() || text.trim().is_empty() {
                ParseAttempt::Malformed("empty moment id or text".into())
            } else {
                ParseAttempt::Parsed(Directive::Comment { moment_id, text })
            }
        }
        _ => ParseAttempt::Unknown,
    }
}

fn one_string(args: &[&str]) -> Option<String> {
    joined_string(args)
}

fn joined_string(args: &[&str]) -> Option<String> {
    if args.is_empty() {
        return None;
    }
    let joined = args.join(":");
    if joined.trim().is_empty() {
        None
    } else {
        Some(joined)
    }
}

fn one_decimal(args: &[&str]) -> Result<Decimal, String> {
    if args.len() != 1 {
        return Err("expected exactly one numeric argument".into());
    }
    parse_decimal(args[0])
}

fn parse_decimal(raw: &str) -> Result<Decimal, String> {
    Decimal::from_str(raw.trim()).map_err(|e| format!("`{}` is not a decimal: {}", raw, e))
}

/// Grammar block appended to every system prompt so the model knows which
/// markers it may emit.
pub fn grammar_instructions() -> &'static str {
    "You may embed the following inline commands anywhere in your reply; they will be \
     executed and removed from the visible text:\n\
     [REMARK:name] rename how you address the user\n\
     [STATUS:text] update your presence line\n\
     [AVATAR_CHANGE] adopt the user's most recent image as your avatar\n\
     [APP:target] open another app screen\n\
     [TRANSFER:amount] send the user money immediately\n\
     [REDPACKET:amount:note] send a red packet the user must open\n\
     [PAYFORME:amount] ask the user to cover a bill\n\
     [FAMILYCARD:limit] share a family card with a spending limit\n\
     [ORDERFOOD:item:price] order food to the user's door\n\
     [INVITE_GROUP:name] invite the user into a group chat\n\
     [CREATE_GROUP:name:member1,member2] create a group chat\n\
     [EMOJI:id] send a sticker from your collection\n\
     [RECALL] withdraw your most recent message\n\
     [LIKE:momentId] like a feed post\n\
     [COMMENT:momentId:text] comment on a feed post\n\
     Use them sparingly and only when they fit the conversation."
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn scenario_remark_strips_marker_and_keeps_surrounding_text() {
        let outcome = scan("你好呀[REMARK:狐狸]我喜欢你");
        assert_eq!(outcome.clean_text(), "你好呀我喜欢你");
        let directives: Vec<_> = outcome.directives().cloned().collect();
        assert_eq!(
            directives,
            vec![Directive::Remark {
                name: "狐狸".to_string()
            }]
        );
    }

    #[test]
    fn scenario_action_prefixed_transfer() {
        let outcome = scan("[ACTION:TRANSFER:88.88]好好花");
        assert_eq!(outcome.clean_text(), "好好花");
        let directives: Vec<_> = outcome.directives().cloned().collect();
        assert_eq!(
            directives,
            vec![Directive::Transfer {
                amount: dec!(88.88)
            }]
        );
    }

    #[test]
    fn unknown_marker_is_preserved_byte_for_byte() {
        let input = "前面[NOT_A_TAG:x]后面";
        let outcome = scan(input);
        assert_eq!(outcome.clean_text(), input);
        assert_eq!(outcome.directives().count(), 0);
        assert!(outcome.malformed.is_empty());
    }

    #[test]
    fn malformed_decimal_is_left_in_place_and_recorded() {
        let outcome = scan("给你[TRANSFER:十块]拿好");
        assert_eq!(outcome.clean_text(), "给你[TRANSFER:十块]拿好");
        assert_eq!(outcome.directives().count(), 0);
        assert_eq!(outcome.malformed.len(), 1);
        assert_eq!(outcome.malformed[0].0, "[TRANSFER:十块]");
    }

    #[test]
    fn stripping_leaves_no_residual_delimiters() {
        let outcome = scan("[RECALL]啊不对[STATUS:逛街中]刚才说错了[EMOJI:cat_wave]");
        assert_eq!(outcome.clean_text(), "啊不对刚才说错了");
        assert!(!outcome.clean_text().contains('['));
        assert!(!outcome.clean_text().contains(']'));
        assert_eq!(outcome.directives().count(), 3);
    }

    #[test]
    fn redpacket_note_and_comment_text_keep_colons() {
        let outcome = scan("[REDPACKET:5.20:给你的:爱心][COMMENT:m1:哈哈:真的吗]");
        let directives: Vec<_> = outcome.directives().cloned().collect();
        assert_eq!(
            directives,
            vec![
                Directive::RedPacket {
                    amount: dec!(5.20),
                    note: Some("给你的:爱心".to_string()),
                },
                Directive::Comment {
                    moment_id: "m1".to_string(),
                    text: "哈哈:真的吗".to_string(),
                },
            ]
        );
    }

    #[test]
    fn create_group_splits_member_list() {
        let outcome = scan("[CREATE_GROUP:吃货群:小狐,小兔、小熊]");
        let directives: Vec<_> = outcome.directives().cloned().collect();
        assert_eq!(
            directives,
            vec![Directive::CreateGroup {
                name: "吃货群".to_string(),
                members: vec!["小狐".into(), "小兔".into(), "小熊".into()],
            }]
        );
    }

    #[test]
    fn unterminated_bracket_is_plain_text() {
        let outcome = scan("这里有个[没有关上");
        assert_eq!(outcome.clean_text(), "这里有个[没有关上");
        assert_eq!(outcome.directives().count(), 0);
    }

    #[test]
    fn directives_are_yielded_in_source_order() {
        let outcome = scan("a[RECALL]b[STATUS:online]c[LIKE:m9]");
        let tags: Vec<_> = outcome
            .directives()
            .map(|d| match d {
                Directive::Recall => "recall",
                Directive::Status { .. } => "status",
                Directive::Like { .. } => "like",
                _ => "other",
            })
            .collect();
        assert_eq!(tags, vec!["recall", "status", "like"]);
        assert_eq!(outcome.clean_text(), "abc");
    }
}
