use crate::{caller::Role, workflow::WorkflowStatus};

/// Whether a caller of `role` may see a form.
///
/// `published_only` narrows the admin view to published forms; other roles
/// only ever see published forms anyway.
pub fn visible(
    role: Role,
    is_public: bool,
    status: WorkflowStatus,
    published_only: bool,
) -> bool {
    let published = status == WorkflowStatus::Published;
    match role {
        Role::Public => is_public && published,
        Role::Staff => published,
        Role::Admin => !published_only || published,
    }
}
