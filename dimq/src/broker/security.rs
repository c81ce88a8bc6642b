/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the broker's authentication and authorization seam.

Plugins are consulted in registration order.  The first plugin to answer `Allow` or `Deny` decides;
a plugin that has no opinion answers `Defer`.  When every plugin defers, the configured default
policy applies.  A few rules hold regardless of plugins and are checked first.
 */

use crate::config::{BrokerConfig, DefaultPolicy};
use crate::mqtt::ProtocolVersion;
use crate::topic::split_shared_filter;

use log::*;

use std::fmt;
use std::sync::Arc;

/// A plugin's answer to a security question
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AuthDecision {
    Allow,
    Deny,

    /// No opinion; ask the next plugin
    Defer,
}

/// The kind of topic access being checked
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AclAccess {

    /// Receiving a message published to the topic
    Read,

    /// Publishing to the topic
    Write,

    Subscribe,

    Unsubscribe,
}

impl fmt::Display for AclAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Identity of a connected client, as seen by security plugins
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClientInfo {
    pub client_id: String,
    pub username: Option<String>,
    pub protocol_version: ProtocolVersion,
}

/// A plugin's answer to one step of MQTT5 extended (AUTH packet) authentication
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExtendedAuthResult {

    /// Authentication finished successfully, optionally with final data for the client
    Success(Option<Vec<u8>>),

    /// Another round trip is needed; the data goes to the client in an AUTH packet
    Continue(Vec<u8>),

    Deny,

    /// The plugin does not handle this authentication method
    Defer,
}

/// Implemented by anything that authenticates clients or authorizes topic access
#[allow(unused_variables)]
pub trait AuthPlugin : Send + Sync {

    /// Decides whether a client may access a topic
    fn check_acl(&self, client: &ClientInfo, topic: &str, access: AclAccess) -> AuthDecision {
        AuthDecision::Defer
    }

    /// Decides whether CONNECT credentials are acceptable
    fn check_credentials(&self, client_id: &str, username: Option<&str>, password: Option<&[u8]>) -> AuthDecision {
        AuthDecision::Defer
    }

    /// First step of extended authentication, from the CONNECT's method and data
    fn authenticate_start(&self, client_id: &str, method: &str, data: Option<&[u8]>) -> ExtendedAuthResult {
        ExtendedAuthResult::Defer
    }

    /// A later step of extended authentication, from an AUTH packet
    fn authenticate_continue(&self, client_id: &str, method: &str, data: Option<&[u8]>) -> ExtendedAuthResult {
        ExtendedAuthResult::Defer
    }
}

/// Ordered set of plugins plus the broker's fixed security rules
#[derive(Clone)]
pub struct SecurityChain {
    plugins: Vec<Arc<dyn AuthPlugin>>,
    allow_anonymous: bool,
    default_acl_policy: DefaultPolicy,
    default_credential_policy: DefaultPolicy,
}

fn policy_to_decision(policy: DefaultPolicy) -> AuthDecision {
    match policy {
        DefaultPolicy::Allow => { AuthDecision::Allow }
        DefaultPolicy::Deny => { AuthDecision::Deny }
    }
}

fn contains_wildcard(value: &str) -> bool {
    value.contains(['+', '#'])
}

impl SecurityChain {

    /// Creates a chain with no plugins, taking its defaults from the broker configuration
    pub fn new(config: &BrokerConfig) -> SecurityChain {
        SecurityChain {
            plugins: Vec::new(),
            allow_anonymous: config.allow_anonymous,
            default_acl_policy: config.default_acl_policy,
            default_credential_policy: config.default_credential_policy,
        }
    }

    /// Appends a plugin to the end of the chain
    pub fn add_plugin(&mut self, plugin: Arc<dyn AuthPlugin>) {
        self.plugins.push(plugin);
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// Decides topic access.  Never returns `Defer`.
    pub fn check_acl(&self, client: &ClientInfo, topic: &str, access: AclAccess) -> AuthDecision {
        let shared = split_shared_filter(topic).is_some();
        if shared && access != AclAccess::Subscribe && access != AclAccess::Unsubscribe {
            warn!("SecurityChain check_acl - {} access to shared subscription topic \"{}\" denied", access, topic);
            return AuthDecision::Deny;
        }

        if access == AclAccess::Write && topic.starts_with("$SYS/") {
            warn!("SecurityChain check_acl - client \"{}\" may not publish to \"{}\"", client.client_id, topic);
            return AuthDecision::Deny;
        }

        if self.plugins.is_empty() {
            return AuthDecision::Allow;
        }

        if contains_wildcard(&client.client_id) || client.username.as_deref().is_some_and(contains_wildcard) {
            warn!("SecurityChain check_acl - client \"{}\" has a wildcard in its identity", client.client_id);
            return AuthDecision::Deny;
        }

        for plugin in self.plugins.iter() {
            match plugin.check_acl(client, topic, access) {
                AuthDecision::Defer => {}
                decision => {
                    debug!("SecurityChain check_acl - {} on \"{}\" for \"{}\": {:?}", access, topic, client.client_id, decision);
                    return decision;
                }
            }
        }

        policy_to_decision(self.default_acl_policy)
    }

    /// Decides whether a client may connect with the given credentials.  Never returns `Defer`.
    pub fn check_credentials(&self, client_id: &str, username: Option<&str>, password: Option<&[u8]>) -> AuthDecision {
        if username.is_none() && !self.allow_anonymous {
            info!("SecurityChain check_credentials - anonymous client \"{}\" rejected", client_id);
            return AuthDecision::Deny;
        }

        for plugin in self.plugins.iter() {
            match plugin.check_credentials(client_id, username, password) {
                AuthDecision::Defer => {}
                decision => { return decision; }
            }
        }

        policy_to_decision(self.default_credential_policy)
    }

    /// Runs one step of extended authentication.  `Defer` means no plugin supports the method.
    pub fn authenticate(&self, client_id: &str, method: &str, data: Option<&[u8]>, continuing: bool) -> ExtendedAuthResult {
        for plugin in self.plugins.iter() {
            let result =
                if continuing {
                    plugin.authenticate_continue(client_id, method, data)
                } else {
                    plugin.authenticate_start(client_id, method, data)
                };

            if result != ExtendedAuthResult::Defer {
                return result;
            }
        }

        ExtendedAuthResult::Defer
    }
}
