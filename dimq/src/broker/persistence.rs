/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module defining the hook a broker uses to tell an external store about message lifetimes.

The broker never reads anything back through this hook.  Notifications are fire-and-forget: a
message is announced when it is first stored and withdrawn when the last reference to it drops.
 */

use crate::message::MessageStore;

/// Receives message lifecycle notifications from a broker context
pub trait PersistenceHook : Send + Sync {

    /// Called once when a message enters the broker.  The returned id is handed back to
    /// `on_message_delete` when the message is released.
    fn on_message_store(&self, message: &MessageStore) -> u64;

    /// Called once when the last reference to a stored message drops
    fn on_message_delete(&self, store_id: u64);
}
