/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing topic name and topic filter rules, plus the tries that index subscriptions and
retained messages by topic level.
 */

pub mod retain;
pub mod subscription;

use crate::error::{DimqError, DimqResult};

use log::*;

const SHARED_SUBSCRIPTION_PREFIX : &str = "$share/";

const MAXIMUM_TOPIC_LENGTH : usize = 65535;

/// Checks that a topic name is usable in a PUBLISH: non-empty, free of wildcards and nulls.
pub fn validate_topic_name(topic: &str) -> DimqResult<()> {
    if topic.is_empty() || topic.len() > MAXIMUM_TOPIC_LENGTH {
        error!("validate_topic_name - invalid topic length ({})", topic.len());
        return Err(DimqError::new_invalid_topic_name(topic));
    }

    if topic.contains(['+', '#', '\0']) {
        error!("validate_topic_name - topic \"{}\" contains a wildcard or null", topic);
        return Err(DimqError::new_invalid_topic_name(topic));
    }

    Ok(())
}

fn validate_filter_levels(filter: &str) -> bool {
    if filter.is_empty() || filter.contains('\0') {
        return false;
    }

    let level_count = filter.split('/').count();
    for (index, level) in filter.split('/').enumerate() {
        if level.contains('#') && (level != "#" || index + 1 != level_count) {
            return false;
        }

        if level.contains('+') && level != "+" {
            return false;
        }
    }

    true
}

/// Checks a subscription topic filter, including the shared-subscription form
/// `$share/<group>/<filter>`.
pub fn validate_topic_filter(filter: &str) -> DimqResult<()> {
    if filter.len() > MAXIMUM_TOPIC_LENGTH {
        return Err(DimqError::new_invalid_topic_filter(filter));
    }

    let valid = match split_shared_filter(filter) {
        Some((group, inner_filter)) => {
            !group.is_empty() && !group.contains(['+', '#']) && validate_filter_levels(inner_filter)
        }
        None => {
            !filter.starts_with("$share/") && filter != "$share" && validate_filter_levels(filter)
        }
    };

    if !valid {
        error!("validate_topic_filter - topic filter \"{}\" is not valid", filter);
        return Err(DimqError::new_invalid_topic_filter(filter));
    }

    Ok(())
}

/// Splits `$share/<group>/<filter>` into its group name and filter.  Returns `None` for
/// filters that are not shared, or that lack a group separator.
pub fn split_shared_filter(filter: &str) -> Option<(&str, &str)> {
    let remainder = filter.strip_prefix(SHARED_SUBSCRIPTION_PREFIX)?;
    remainder.split_once('/')
}

/// Whether a topic begins with `$` and is therefore hidden from first-level wildcards
pub fn is_system_topic(topic: &str) -> bool {
    topic.starts_with('$')
}

/// Tests a single topic name against a single (non-shared) topic filter
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if is_system_topic(topic) && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => { return true; }
            (Some("+"), Some(_)) => {}
            (Some(filter_level), Some(topic_level)) => {
                if filter_level != topic_level {
                    return false;
                }
            }
            (None, None) => { return true; }
            _ => { return false; }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[test]
    fn topic_name_validation() {
        assert!(validate_topic_name("a/b/c").is_ok());
        assert!(validate_topic_name("/").is_ok());
        assert!(validate_topic_name("$SYS/broker/uptime").is_ok());

        assert_matches!(validate_topic_name(""), Err(DimqError::InvalidTopicName(_)));
        assert_matches!(validate_topic_name("a/+/c"), Err(DimqError::InvalidTopicName(_)));
        assert_matches!(validate_topic_name("a/#"), Err(DimqError::InvalidTopicName(_)));
    }

    #[test]
    fn topic_filter_validation() {
        for filter in ["#", "+", "a/#", "+/b/+", "a//b", "/#", "$share/group/a/+", "$share/g/#"] {
            assert!(validate_topic_filter(filter).is_ok(), "{}", filter);
        }

        for filter in ["", "a/#/b", "a#", "a/b+", "#/", "$share/group", "$share//a", "$share/g+/a", "$share/g/a/#/b"] {
            assert_matches!(validate_topic_filter(filter), Err(DimqError::InvalidTopicFilter(_)), "{}", filter);
        }
    }

    #[test]
    fn shared_filter_split() {
        assert_eq!(Some(("workers", "jobs/+")), split_shared_filter("$share/workers/jobs/+"));
        assert_eq!(None, split_shared_filter("jobs/+"));
        assert_eq!(None, split_shared_filter("$share/workers"));
    }

    #[test]
    fn filter_matching() {
        assert!(topic_matches_filter("foo/bar", "foo/#"));
        assert!(topic_matches_filter("foo/bar", "+/bar"));
        assert!(topic_matches_filter("foo/bar", "foo/bar"));
        assert!(!topic_matches_filter("foo/bar", "foo/+/+"));
        assert!(topic_matches_filter("foo", "foo/#"));

        assert!(!topic_matches_filter("$SYS/broker/uptime", "#"));
        assert!(!topic_matches_filter("$SYS/broker/uptime", "+/broker/uptime"));
        assert!(topic_matches_filter("$SYS/broker/uptime", "$SYS/#"));
    }
}
