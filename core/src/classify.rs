//! Search intent classification
//!
//! Decides what kind of answer a search wants from its filter and the
//! requested attribute list. Rules are checked in a fixed order and the
//! first match wins.

use crate::filter::Filter;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestIntent {
    SingleUser(String),
    AllUsers,
    GroupSearch,
    MixedSearch,
    Unmatched,
}

impl RequestIntent {
    /// Short label used for metrics and events.
    pub fn label(&self) -> &'static str {
        match self {
            RequestIntent::SingleUser(_) => "single_user",
            RequestIntent::AllUsers => "all_users",
            RequestIntent::GroupSearch => "group_search",
            RequestIntent::MixedSearch => "mixed_search",
            RequestIntent::Unmatched => "unmatched",
        }
    }
}

impl fmt::Display for RequestIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestIntent::SingleUser(name) => write!(f, "single_user({})", name),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Attributes requested by user synchronisation tools with an empty filter.
pub const USER_SYNC_ATTRIBUTES: &[&str] = &[
    "uid", "firstname", "lastname", "email", "keys", "enable", "comment", "expire",
];

const PERSON_CLASSES: &[&str] = &["posixAccount", "inetOrgPerson", "person"];
const GROUP_CLASSES: &[&str] = &["posixGroup", "groupOfNames"];
const MEMBERSHIP_ATTRIBUTES: &[&str] = &["member", "uniqueMember", "memberOf"];

/// Classify a textual filter. An unparseable filter is `Unmatched`.
pub fn classify(filter: &str, attributes: &[String]) -> RequestIntent {
    if filter.trim().is_empty() {
        return classify_filter(None, attributes);
    }
    match Filter::parse(filter) {
        Ok(parsed) => classify_filter(Some(&parsed), attributes),
        Err(_) => RequestIntent::Unmatched,
    }
}

/// Classify a parsed filter; `None` stands for the empty filter.
pub fn classify_filter(filter: Option<&Filter>, attributes: &[String]) -> RequestIntent {
    let requested = |names: &[&str]| {
        attributes
            .iter()
            .any(|a| names.iter().any(|n| a.eq_ignore_ascii_case(n)))
    };

    let Some(filter) = filter else {
        if requested(USER_SYNC_ATTRIBUTES) {
            return RequestIntent::AllUsers;
        }
        if requests_group_fields(attributes) || requested(MEMBERSHIP_ATTRIBUTES) {
            return RequestIntent::GroupSearch;
        }
        return RequestIntent::MixedSearch;
    };

    if let Some(name) = filter.equality_value("uid") {
        if !name.is_empty() && name != "*" {
            return RequestIntent::SingleUser(name.to_string());
        }
    }

    if filter.has_presence("uid") || filter.asserts_any("objectClass", PERSON_CLASSES) {
        return RequestIntent::AllUsers;
    }

    if filter.asserts_any("objectClass", GROUP_CLASSES)
        || filter.mentions("memberUid")
        || filter.mentions("gidNumber")
        || requests_group_fields(attributes)
    {
        return RequestIntent::GroupSearch;
    }

    if filter.mentions("objectClass") {
        return RequestIntent::MixedSearch;
    }

    RequestIntent::Unmatched
}

fn requests_group_fields(attributes: &[String]) -> bool {
    let only_cn = attributes.len() == 1 && attributes[0].eq_ignore_ascii_case("cn");
    only_cn
        || attributes
            .iter()
            .any(|a| a.eq_ignore_ascii_case("gidNumber") || a.eq_ignore_ascii_case("memberUid"))
}

/// True when a group search carries a term that narrows the result, so the
/// provider's `find_groups` should be consulted rather than `get_all_groups`.
pub fn has_group_discriminator(filter: &Filter) -> bool {
    filter.any(&|f| match f {
        Filter::Equality(a, v) => {
            v != "*"
                && (a.eq_ignore_ascii_case("memberUid")
                    || a.eq_ignore_ascii_case("cn")
                    || a.eq_ignore_ascii_case("gidNumber"))
        }
        _ => false,
    })
}
