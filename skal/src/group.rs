//! Multicast groups
//!
//! A group is a named endpoint realized as an ordinary worker whose
//! handler fans incoming messages out to subscribers. Subscriptions pair
//! a subscriber name with a filter: an empty filter forwards everything,
//! a non-empty filter is a regular expression matched against message
//! actions. A subscriber may hold several subscriptions with different
//! filters.
//!
//! Groups come to life two ways. [`create`] binds a persistent group to a
//! chosen executor. [`subscribe`] to a non-existent group creates it
//! implicitly on an arbitrarily picked executor; an implicit group is
//! destroyed again when its last subscription goes away.

use std::collections::HashMap;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::actions;
use crate::alarm::{self, Alarm, Severity};
use crate::domain::{self, Name};
use crate::error::{Result, SkalError};
use crate::executor::{self, ExecutorHandle};
use crate::msg::Message;
use crate::router;
use crate::worker::{self, Control, WorkerConfig};

static GROUPS: Lazy<DashMap<Name, Arc<Group>>> = Lazy::new(DashMap::new);

/// A multicast group's subscription table
///
/// The group itself lives in the process-wide group registry; messages
/// reach it through its worker, created alongside.
pub struct Group {
    name: Name,
    is_explicit: bool,
    /// Subscriber name -> filter string -> compiled filter (`None` for
    /// the match-everything empty filter)
    subscribers: Mutex<HashMap<Name, HashMap<String, Option<Regex>>>>,
}

impl Group {
    /// Fan a message out to every matching subscriber
    fn forward(&self, msg: Message) {
        // Reserved actions are control traffic for the group's own
        // worker, never fanned out.
        if actions::is_reserved(msg.action()) {
            return;
        }
        let targets: Vec<Name> = {
            let subscribers = self.subscribers.lock();
            subscribers
                .iter()
                .filter(|(_, filters)| {
                    filters
                        .values()
                        .any(|f| f.as_ref().map_or(true, |re| re.is_match(msg.action())))
                })
                .map(|(name, _)| name.clone())
                .collect()
        };
        debug!(group = %self.name, action = msg.action(), fanout = targets.len(), "forwarding");
        for target in targets {
            let mut copy = msg.clone();
            copy.set_recipient(target);
            worker::send(copy);
        }
    }
}

fn create_group(name: Name, executor: &ExecutorHandle, is_explicit: bool) -> Result<Arc<Group>> {
    let group = Arc::new(Group {
        name: name.clone(),
        is_explicit,
        subscribers: Mutex::new(HashMap::new()),
    });
    match GROUPS.entry(name.clone()) {
        dashmap::mapref::entry::Entry::Occupied(_) => {
            return Err(SkalError::DuplicateName(name.to_string()))
        }
        dashmap::mapref::entry::Entry::Vacant(slot) => {
            slot.insert(Arc::clone(&group));
        }
    }

    let fan = Arc::clone(&group);
    let created = executor.add_worker(WorkerConfig::new(name.to_string()), move |msg: Message| {
        fan.forward(msg);
        Control::Continue
    });
    if let Err(err) = created {
        GROUPS.remove(&name);
        return Err(err);
    }

    debug!(group = %name, explicit = is_explicit, "group created");
    notify_router(actions::CREATE_GROUP, &name, None, None);
    Ok(group)
}

/// Explicitly create a persistent group bound to the given executor
///
/// An explicit group stays alive with no subscribers, until
/// [`destroy`]ed.
pub fn create(group_name: &str, executor: &ExecutorHandle) -> Result<()> {
    create_group(Name::resolve(group_name), executor, true).map(|_| ())
}

/// Destroy a group, dropping all its subscriptions
///
/// No-op when no such group exists.
pub fn destroy(group_name: &str) {
    let name = Name::resolve(group_name);
    let Some((_, group)) = GROUPS.remove(&name) else {
        return;
    };
    group.subscribers.lock().clear();
    worker::send(Message::internal(
        domain::me(),
        name.clone(),
        actions::TERMINATE,
    ));
    debug!(group = %name, "group destroyed");
    notify_router(actions::DESTROY_GROUP, &name, None, None);
}

/// Add a subscription to a group
///
/// Creates the group implicitly (on an arbitrary executor) if it does
/// not exist. An empty `filter` forwards every action; otherwise
/// `filter` must be a valid regular expression, or the subscription is
/// refused with an alarm. Subscribing again with the same filter is a
/// no-op.
pub fn subscribe(group_name: &str, subscriber_name: &str, filter: &str) -> Result<()> {
    let name = Name::resolve(group_name);
    let subscriber = Name::resolve(subscriber_name);

    let compiled = if filter.is_empty() {
        None
    } else {
        match Regex::new(filter) {
            Ok(re) => Some(re),
            Err(err) => {
                warn!(group = %name, filter, "rejecting unparseable subscription filter");
                alarm::raise(Alarm::new(
                    "skal-bad-filter",
                    Severity::Warning,
                    true,
                    true,
                    format!("subscription filter `{filter}` does not compile: {err}"),
                ));
                return Err(SkalError::BadFilter {
                    filter: filter.to_string(),
                    reason: err.to_string(),
                });
            }
        }
    };

    let group = match GROUPS.get(&name) {
        Some(entry) => Arc::clone(entry.value()),
        None => {
            let executor = executor::pick_any().ok_or_else(|| {
                SkalError::NoExecutor(name.to_string())
            })?;
            match create_group(name.clone(), &executor, false) {
                Ok(group) => group,
                // Lost a creation race; the group exists now
                Err(SkalError::DuplicateName(_)) => GROUPS
                    .get(&name)
                    .map(|entry| Arc::clone(entry.value()))
                    .ok_or_else(|| SkalError::DuplicateName(name.to_string()))?,
                Err(err) => return Err(err),
            }
        }
    };

    group
        .subscribers
        .lock()
        .entry(subscriber.clone())
        .or_default()
        .entry(filter.to_string())
        .or_insert(compiled);

    debug!(group = %name, subscriber = %subscriber, filter, "subscribed");
    notify_router(actions::SUBSCRIBE, &name, Some(&subscriber), Some(filter));
    Ok(())
}

/// Remove a subscription from a group
///
/// An empty `filter` removes every subscription of that subscriber.
/// No-op when the group, subscriber or filter does not exist. An
/// implicitly created group is destroyed when its last subscription is
/// removed.
pub fn unsubscribe(group_name: &str, subscriber_name: &str, filter: &str) {
    let name = Name::resolve(group_name);
    let subscriber = Name::resolve(subscriber_name);
    let Some(group) = GROUPS.get(&name).map(|entry| Arc::clone(entry.value())) else {
        return;
    };

    let now_empty = {
        let mut subscribers = group.subscribers.lock();
        if let Some(filters) = subscribers.get_mut(&subscriber) {
            if filter.is_empty() {
                subscribers.remove(&subscriber);
            } else {
                filters.remove(filter);
                if filters.is_empty() {
                    subscribers.remove(&subscriber);
                }
            }
        }
        subscribers.is_empty()
    };

    debug!(group = %name, subscriber = %subscriber, filter, "unsubscribed");
    notify_router(actions::UNSUBSCRIBE, &name, Some(&subscriber), Some(filter));

    if now_empty && !group.is_explicit {
        destroy(group_name);
    }
}

/// Whether a group with that name currently exists
pub fn exists(group_name: &str) -> bool {
    GROUPS.contains_key(&Name::resolve(group_name))
}

/// Number of subscribers of a group; 0 when the group does not exist
pub fn subscriber_count(group_name: &str) -> usize {
    GROUPS
        .get(&Name::resolve(group_name))
        .map(|entry| entry.subscribers.lock().len())
        .unwrap_or(0)
}

fn notify_router(action: &str, group: &Name, subscriber: Option<&Name>, filter: Option<&str>) {
    if !router::is_installed() {
        return;
    }
    let mut msg = Message::internal(
        domain::me(),
        Name::resolve(domain::ROUTER_NAME),
        action,
    );
    msg.add_string("group", group.to_string());
    if let Some(subscriber) = subscriber {
        msg.add_string("subscriber", subscriber.to_string());
    }
    if let Some(filter) = filter {
        msg.add_string("filter", filter);
    }
    worker::send(msg);
}
