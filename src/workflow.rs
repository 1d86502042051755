//! Publication state machine for forms.
//!
//! A form enters the machine in [`WorkflowStatus::Draft`] and moves through
//! the transitions in [`TRANSITIONS`]. Every accepted transition is recorded
//! as an immutable [`WorkflowEvent`]; replaying a form's events from the
//! beginning always yields its current status.

use std::{fmt, str::FromStr};

use redb::{ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};

use crate::{
    caller::{Caller, Capability},
    error::{Error, Result},
    form::{Form, FormId},
};

/// `(form_id, ordinal) -> json(WorkflowEvent)`
pub(crate) const WORKFLOW_EVENTS: TableDefinition<(u64, u64), &[u8]> =
    TableDefinition::new("workflow_events");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    PendingReview,
    Approved,
    Published,
    Archived,
}

impl WorkflowStatus {
    pub const ALL: [WorkflowStatus; 5] = [
        WorkflowStatus::Draft,
        WorkflowStatus::PendingReview,
        WorkflowStatus::Approved,
        WorkflowStatus::Published,
        WorkflowStatus::Archived,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Draft => "draft",
            WorkflowStatus::PendingReview => "pending_review",
            WorkflowStatus::Approved => "approved",
            WorkflowStatus::Published => "published",
            WorkflowStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        WorkflowStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| Error::Invalid(format!("unknown status '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Entry into the machine. Only ever recorded by form creation.
    Create,
    SubmitReview,
    Approve,
    Reject,
    Publish,
    Unpublish,
    Archive,
    Restore,
}

impl WorkflowAction {
    pub const ALL: [WorkflowAction; 8] = [
        WorkflowAction::Create,
        WorkflowAction::SubmitReview,
        WorkflowAction::Approve,
        WorkflowAction::Reject,
        WorkflowAction::Publish,
        WorkflowAction::Unpublish,
        WorkflowAction::Archive,
        WorkflowAction::Restore,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowAction::Create => "create",
            WorkflowAction::SubmitReview => "submit_review",
            WorkflowAction::Approve => "approve",
            WorkflowAction::Reject => "reject",
            WorkflowAction::Publish => "publish",
            WorkflowAction::Unpublish => "unpublish",
            WorkflowAction::Archive => "archive",
            WorkflowAction::Restore => "restore",
        }
    }

    /// Target status when applied to `from`, or `None` if the action is not
    /// defined for that status.
    pub fn target(self, from: WorkflowStatus) -> Option<WorkflowStatus> {
        TRANSITIONS
            .iter()
            .find(|t| t.action == self && t.from == from)
            .map(|t| t.to)
    }
}

impl fmt::Display for WorkflowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        WorkflowAction::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| Error::Invalid(format!("unknown action '{s}'")))
    }
}

/// One row of the transition table.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub action: WorkflowAction,
    pub from: WorkflowStatus,
    pub to: WorkflowStatus,
    pub capability: Capability,
}

pub const TRANSITIONS: [Transition; 7] = [
    Transition {
        action: WorkflowAction::SubmitReview,
        from: WorkflowStatus::Draft,
        to: WorkflowStatus::PendingReview,
        capability: Capability::SubmitForReview,
    },
    Transition {
        action: WorkflowAction::Approve,
        from: WorkflowStatus::PendingReview,
        to: WorkflowStatus::Approved,
        capability: Capability::Approve,
    },
    Transition {
        action: WorkflowAction::Reject,
        from: WorkflowStatus::PendingReview,
        to: WorkflowStatus::Draft,
        capability: Capability::Review,
    },
    Transition {
        action: WorkflowAction::Publish,
        from: WorkflowStatus::Approved,
        to: WorkflowStatus::Published,
        capability: Capability::Publish,
    },
    Transition {
        action: WorkflowAction::Unpublish,
        from: WorkflowStatus::Published,
        to: WorkflowStatus::Draft,
        capability: Capability::Publish,
    },
    Transition {
        action: WorkflowAction::Archive,
        from: WorkflowStatus::Published,
        to: WorkflowStatus::Archived,
        capability: Capability::Publish,
    },
    Transition {
        action: WorkflowAction::Restore,
        from: WorkflowStatus::Archived,
        to: WorkflowStatus::Published,
        capability: Capability::Publish,
    },
];

/// Validate `action` on `form` for `caller` without touching any state.
///
/// Checks run in a fixed order: the action must exist for the current
/// status, the caller must hold the capability, an approver must not be the
/// creator, and a form submitted for review must be complete.
pub fn plan(
    form: &Form,
    action: WorkflowAction,
    caller: &Caller,
) -> Result<Transition> {
    let transition = TRANSITIONS
        .iter()
        .find(|t| t.action == action && t.from == form.status)
        .copied()
        .ok_or(Error::InvalidTransition {
            action,
            from: form.status,
        })?;

    let owner_submit = action == WorkflowAction::SubmitReview
        && caller.id == form.created_by
        && caller.can(Capability::FormCreate);
    if !owner_submit {
        caller.require(transition.capability)?;
    }

    if action == WorkflowAction::Approve && caller.id == form.created_by {
        return Err(Error::SeparationOfDutyViolation {
            actor: caller.id.clone(),
            form: form.id,
        });
    }

    if action == WorkflowAction::SubmitReview {
        let missing = missing_for_review(form);
        if !missing.is_empty() {
            return Err(Error::IncompleteForm {
                form: form.id,
                missing,
            });
        }
    }

    Ok(transition)
}

/// Fields a form still needs before it can be submitted for review.
pub fn missing_for_review(form: &Form) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if form.title.trim().is_empty() {
        missing.push("title");
    }
    if form.category.trim().is_empty() {
        missing.push("category");
    }
    if form.current_version == 0 {
        missing.push("file version");
    }
    if form.business_areas.is_empty() {
        missing.push("business area");
    }
    missing
}

/// An immutable record of one accepted workflow step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub form_id: FormId,
    /// Position of this event in the form's history, starting at 0.
    pub ordinal: u64,
    pub action: WorkflowAction,
    /// `None` only for the creation event.
    pub from: Option<WorkflowStatus>,
    pub to: WorkflowStatus,
    pub actor: String,
    pub reason: Option<String>,
    pub timestamp: u64,
}

/// A workflow event before it is assigned its position.
#[derive(Debug, Clone)]
pub(crate) struct NewWorkflowEvent {
    pub action: WorkflowAction,
    pub from: Option<WorkflowStatus>,
    pub to: WorkflowStatus,
    pub actor: String,
    pub reason: Option<String>,
}

/// Append `event` as the next entry of `form_id`'s history.
pub(crate) fn append_event(
    txn: &WriteTransaction,
    form_id: FormId,
    event: NewWorkflowEvent,
    timestamp: u64,
) -> Result<WorkflowEvent> {
    let mut table = txn.open_table(WORKFLOW_EVENTS)?;
    let ordinal = match table
        .range((form_id.0, 0)..=(form_id.0, u64::MAX))?
        .next_back()
    {
        Some(entry) => entry?.0.value().1 + 1,
        None => 0,
    };

    let stored = WorkflowEvent {
        form_id,
        ordinal,
        action: event.action,
        from: event.from,
        to: event.to,
        actor: event.actor,
        reason: event.reason,
        timestamp,
    };
    let bytes = serde_json::to_vec(&stored)?;
    table.insert((form_id.0, ordinal), bytes.as_slice())?;
    Ok(stored)
}

/// All events of a form, in the order they were recorded.
pub(crate) fn list_events(
    table: &impl ReadableTable<(u64, u64), &'static [u8]>,
    form_id: FormId,
) -> Result<Vec<WorkflowEvent>> {
    let mut events = Vec::new();
    for entry in table.range((form_id.0, 0)..=(form_id.0, u64::MAX))? {
        let (_, v) = entry?;
        events.push(serde_json::from_slice(v.value())?);
    }
    Ok(events)
}

/// Replay a form's history and return the status it ends in.
///
/// Fails if the sequence does not start with creation, if an event's
/// `from` does not match the replayed status, or if an event's action does
/// not lead to its recorded `to`.
pub fn replay(events: &[WorkflowEvent]) -> Result<WorkflowStatus> {
    let mut current: Option<WorkflowStatus> = None;

    for event in events {
        if event.from != current {
            return Err(Error::Invalid(format!(
                "event {} of form {} starts from {:?}, expected {:?}",
                event.ordinal, event.form_id, event.from, current
            )));
        }
        let next = match (event.action, current) {
            (WorkflowAction::Create, None) => WorkflowStatus::Draft,
            (action, Some(from)) => action.target(from).ok_or(
                Error::InvalidTransition { action, from },
            )?,
            (action, None) => {
                return Err(Error::Invalid(format!(
                    "history of form {} starts with {action}",
                    event.form_id
                )));
            }
        };
        if next != event.to {
            return Err(Error::Invalid(format!(
                "event {} of form {} records {} but replays to {}",
                event.ordinal, event.form_id, event.to, next
            )));
        }
        current = Some(next);
    }

    current.ok_or_else(|| Error::Invalid("empty workflow history".into()))
}
