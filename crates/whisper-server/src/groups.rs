//! Group rosters and group message fanout.
//!
//! Membership lives in SQLite. A group message arrives as one envelope per
//! recipient, each sealed and signed by the sender; the server checks every
//! envelope before delivering any of them.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use whisper_shared::constants::MAX_GROUP_MEMBERS;
use whisper_shared::crypto::{canonical_message, verify_prehashed};
use whisper_shared::protocol::{
    GroupCreatePayload, GroupEventPayload, GroupMemberView, GroupSendMessagePayload,
    GroupUpdatePayload, GroupView, MessageAcceptedPayload, ReceivedMessage, ServerMessage,
};
use whisper_shared::types::{GroupEventKind, Role};
use whisper_shared::validation::{
    check_timestamp, normalize_group_title, validate_ciphertext, validate_client_id,
    validate_nonce, validate_signature,
};
use whisper_store::{Group, GroupMember};

use crate::connections::ConnectionManager;
use crate::db::DbHandle;
use crate::error::{Result, ServerError};
use crate::router::{Delivery, MessageRouter};

pub struct GroupService {
    db: DbHandle,
    connections: Arc<ConnectionManager>,
    router: Arc<MessageRouter>,
}

impl GroupService {
    pub fn new(db: DbHandle, connections: Arc<ConnectionManager>, router: Arc<MessageRouter>) -> Self {
        Self {
            db,
            connections,
            router,
        }
    }

    /// Create a group owned by `actor`. The returned event is the actor's
    /// reply; every other member is notified directly.
    pub async fn create_group(&self, actor: &str, p: &GroupCreatePayload) -> Result<GroupEventPayload> {
        let title = normalize_group_title(&p.title)?;

        let mut seen = HashSet::new();
        let member_ids: Vec<String> = p
            .member_ids
            .iter()
            .filter(|id| id.as_str() != actor && seen.insert(id.as_str()))
            .cloned()
            .collect();
        if member_ids.len() + 1 > MAX_GROUP_MEMBERS {
            return Err(ServerError::InvalidPayload(format!(
                "a group holds at most {MAX_GROUP_MEMBERS} members"
            )));
        }

        let now = Utc::now();
        let group = Group {
            group_id: Uuid::new_v4().to_string(),
            title,
            owner_id: actor.to_string(),
            created_at: now,
            updated_at: now,
        };
        let mut roster = vec![new_member(&group.group_id, actor, Role::Owner, now)];
        roster.extend(
            member_ids
                .iter()
                .map(|id| new_member(&group.group_id, id, Role::Member, now)),
        );

        let event = GroupEventPayload {
            event: GroupEventKind::Created,
            group: view(&group, &roster),
        };
        self.db
            .call(move |db| {
                if !db.all_active(&member_ids)? {
                    return Err(ServerError::NotFound("member".to_string()));
                }
                db.create_group(&group, &roster)?;
                Ok(())
            })
            .await?;

        info!(
            group_id = %event.group.group_id,
            owner = actor,
            members = event.group.members.len(),
            "Group created"
        );
        let recipients: Vec<String> = event.group.members.iter().map(|m| m.whisper_id.clone()).collect();
        self.broadcast(&recipients, actor, &event).await;
        Ok(event)
    }

    /// Apply a title/roster/role change atomically. Active members and anyone
    /// removed by this change are notified.
    pub async fn update_group(&self, actor: &str, p: &GroupUpdatePayload) -> Result<GroupEventPayload> {
        validate_client_id("groupId", &p.group_id)?;
        let title = p.title.as_deref().map(normalize_group_title).transpose()?;

        let actor_id = actor.to_string();
        let update = p.clone();
        let (event, recipients) = self
            .db
            .call(move |db| {
                let mut group = db
                    .get_group(&update.group_id)?
                    .ok_or_else(|| ServerError::NotFound("group".to_string()))?;
                let mut roster = db.list_members(&update.group_id, true)?;
                if !db.all_active(&update.add_members)? {
                    return Err(ServerError::NotFound("member".to_string()));
                }

                let outcome = apply_update(
                    &mut group,
                    &mut roster,
                    &actor_id,
                    title,
                    &update,
                    Utc::now(),
                )?;
                let changed: Vec<GroupMember> = roster
                    .iter()
                    .filter(|m| outcome.changed.contains(&m.whisper_id))
                    .cloned()
                    .collect();
                db.save_group(&group, &changed)?;

                let visible: Vec<GroupMember> = roster
                    .into_iter()
                    .filter(|m| m.is_active() || outcome.removed.contains(&m.whisper_id))
                    .collect();
                let recipients = visible.iter().map(|m| m.whisper_id.clone()).collect::<Vec<_>>();
                let event = GroupEventPayload {
                    event: GroupEventKind::Updated,
                    group: view(&group, &visible),
                };
                Ok((event, recipients))
            })
            .await?;

        info!(group_id = %p.group_id, actor, "Group updated");
        self.broadcast(&recipients, actor, &event).await;
        Ok(event)
    }

    /// Verify every per-recipient envelope, then deliver each one.
    pub async fn send_group_message(
        &self,
        actor: &str,
        p: &GroupSendMessagePayload,
    ) -> Result<MessageAcceptedPayload> {
        if p.from != actor {
            return Err(ServerError::Forbidden("from does not match session".to_string()));
        }
        check_timestamp(p.timestamp, Utc::now().timestamp_millis())?;
        validate_client_id("groupId", &p.group_id)?;
        validate_client_id("messageId", &p.message_id)?;
        if p.recipients.is_empty() {
            return Err(ServerError::InvalidPayload("no recipients".to_string()));
        }
        let mut seen = HashSet::new();
        for r in &p.recipients {
            if r.to == actor {
                return Err(ServerError::InvalidPayload("sender listed as recipient".to_string()));
            }
            if !seen.insert(r.to.as_str()) {
                return Err(ServerError::InvalidPayload(format!("duplicate recipient {}", r.to)));
            }
        }

        let mut signatures = Vec::with_capacity(p.recipients.len());
        for r in &p.recipients {
            validate_nonce("nonce", &r.nonce)?;
            validate_ciphertext(&r.ciphertext)?;
            signatures.push(validate_signature("sig", &r.sig)?);
            self.router.check_attachment(actor, r.attachment.as_ref()).await?;
        }

        let group_id = p.group_id.clone();
        let sender = actor.to_string();
        let (sign_key, active) = self
            .db
            .call(move |db| {
                db.get_group(&group_id)?
                    .ok_or_else(|| ServerError::NotFound("group".to_string()))?;
                let identity = db
                    .find_identity(&sender)?
                    .ok_or_else(|| ServerError::AuthFailed("unknown sender".to_string()))?;
                let active: HashSet<String> = db
                    .list_members(&group_id, false)?
                    .into_iter()
                    .map(|m| m.whisper_id)
                    .collect();
                Ok((identity.sign_public_key, active))
            })
            .await?;
        if !active.contains(actor) {
            return Err(ServerError::Forbidden("not a member of this group".to_string()));
        }
        if let Some(outsider) = p.recipients.iter().find(|r| !active.contains(&r.to)) {
            return Err(ServerError::Forbidden(format!(
                "{} is not a member of this group",
                outsider.to
            )));
        }

        let accepted = MessageAcceptedPayload {
            message_id: p.message_id.clone(),
            status: "sent".to_string(),
        };
        if !self.router.claim(actor, &p.message_id) {
            debug!(from = actor, message_id = %p.message_id, "Duplicate group envelope acknowledged");
            return Ok(accepted);
        }

        for (r, signature) in p.recipients.iter().zip(&signatures) {
            let canonical = canonical_message(
                "group_send_message",
                &p.message_id,
                &p.from,
                &p.group_id,
                p.timestamp,
                &r.nonce,
                &r.ciphertext,
            );
            if verify_prehashed(&sign_key, canonical.as_bytes(), signature).is_err() {
                self.router.release(actor, &p.message_id);
                warn!(from = actor, group_id = %p.group_id, to = %r.to, "Group envelope signature rejected");
                return Err(ServerError::AuthFailed("bad signature".to_string()));
            }
        }

        let online = match self.fan_out(p).await {
            Ok(online) => online,
            Err(e) => {
                self.router.release(actor, &p.message_id);
                return Err(e);
            }
        };

        debug!(
            from = actor,
            group_id = %p.group_id,
            recipients = p.recipients.len(),
            online,
            "Group envelope fanned out"
        );
        Ok(accepted)
    }

    /// Grant every referenced attachment, then deliver each copy. Grants go
    /// first so a storage failure stops the batch before anyone receives it.
    async fn fan_out(&self, p: &GroupSendMessagePayload) -> Result<usize> {
        for r in &p.recipients {
            if let Some(attachment) = &r.attachment {
                self.router
                    .attachments()
                    .grant_access(&attachment.object_key, &r.to)
                    .await?;
            }
        }

        let mut online = 0;
        for r in &p.recipients {
            let message = ReceivedMessage {
                message_id: p.message_id.clone(),
                group_id: Some(p.group_id.clone()),
                from: p.from.clone(),
                to: r.to.clone(),
                msg_type: p.msg_type,
                timestamp: p.timestamp,
                nonce: r.nonce.clone(),
                ciphertext: r.ciphertext.clone(),
                sig: r.sig.clone(),
                reply_to: p.reply_to.clone(),
                reactions: p.reactions.clone(),
                attachment: r.attachment.clone(),
            };
            if self.router.deliver_or_queue(message).await? == Delivery::Online {
                online += 1;
            }
        }
        Ok(online)
    }

    async fn broadcast(&self, recipients: &[String], except: &str, event: &GroupEventPayload) {
        let frame = ServerMessage::GroupEvent(event.clone());
        for id in recipients.iter().filter(|id| id.as_str() != except) {
            self.connections.send_to_user(id, &frame).await;
        }
    }
}

/// Roster rows touched by an update.
#[derive(Debug, Default)]
struct UpdateOutcome {
    changed: HashSet<String>,
    removed: HashSet<String>,
}

/// Apply an update to an in-memory group. Either the whole update is valid
/// and applied, or an error is returned and the caller persists nothing.
fn apply_update(
    group: &mut Group,
    roster: &mut Vec<GroupMember>,
    actor: &str,
    title: Option<String>,
    p: &GroupUpdatePayload,
    now: DateTime<Utc>,
) -> Result<UpdateOutcome> {
    let actor_role = roster
        .iter()
        .find(|m| m.whisper_id == actor && m.is_active())
        .map(|m| m.role)
        .ok_or_else(|| ServerError::Forbidden("not a member of this group".to_string()))?;

    if title.is_none()
        && p.add_members.is_empty()
        && p.remove_members.is_empty()
        && p.role_changes.is_empty()
    {
        return Err(ServerError::InvalidPayload("empty group update".to_string()));
    }

    let manager = actor_role.can_manage();
    let mut outcome = UpdateOutcome::default();

    if let Some(title) = title {
        if !manager {
            return Err(ServerError::Forbidden("only owners and admins may rename".to_string()));
        }
        group.title = title;
    }

    for id in &p.remove_members {
        if *id == group.owner_id {
            return Err(ServerError::Forbidden("the owner cannot be removed".to_string()));
        }
        if id != actor && !manager {
            return Err(ServerError::Forbidden("only owners and admins may remove".to_string()));
        }
        if let Some(member) = roster.iter_mut().find(|m| m.whisper_id == *id && m.is_active()) {
            member.removed_at = Some(now);
            outcome.changed.insert(id.clone());
            outcome.removed.insert(id.clone());
        }
    }

    if !p.add_members.is_empty() && !manager {
        return Err(ServerError::Forbidden("only owners and admins may add".to_string()));
    }
    for id in &p.add_members {
        match roster.iter_mut().find(|m| m.whisper_id == *id) {
            Some(member) if member.is_active() => continue,
            Some(member) => {
                member.removed_at = None;
                member.role = Role::Member;
                member.joined_at = now;
            }
            None => roster.push(new_member(&group.group_id, id, Role::Member, now)),
        }
        outcome.changed.insert(id.clone());
        outcome.removed.remove(id);
    }
    if roster.iter().filter(|m| m.is_active()).count() > MAX_GROUP_MEMBERS {
        return Err(ServerError::InvalidPayload(format!(
            "a group holds at most {MAX_GROUP_MEMBERS} members"
        )));
    }

    if !p.role_changes.is_empty() && actor_role != Role::Owner {
        return Err(ServerError::Forbidden("only the owner may change roles".to_string()));
    }
    for change in &p.role_changes {
        if change.whisper_id == group.owner_id {
            return Err(ServerError::Forbidden("the owner's role is fixed".to_string()));
        }
        if change.role == Role::Owner {
            return Err(ServerError::InvalidPayload("ownership cannot be assigned".to_string()));
        }
        let member = roster
            .iter_mut()
            .find(|m| m.whisper_id == change.whisper_id && m.is_active())
            .ok_or_else(|| ServerError::NotFound("member".to_string()))?;
        member.role = change.role;
        outcome.changed.insert(change.whisper_id.clone());
    }

    group.updated_at = now;
    Ok(outcome)
}

fn new_member(group_id: &str, whisper_id: &str, role: Role, now: DateTime<Utc>) -> GroupMember {
    GroupMember {
        group_id: group_id.to_string(),
        whisper_id: whisper_id.to_string(),
        role,
        joined_at: now,
        removed_at: None,
    }
}

fn view(group: &Group, members: &[GroupMember]) -> GroupView {
    GroupView {
        group_id: group.group_id.clone(),
        title: group.title.clone(),
        owner_id: group.owner_id.clone(),
        created_at: group.created_at.timestamp_millis(),
        updated_at: group.updated_at.timestamp_millis(),
        members: members
            .iter()
            .map(|m| GroupMemberView {
                whisper_id: m.whisper_id.clone(),
                role: m.role,
                joined_at: m.joined_at.timestamp_millis(),
                removed_at: m.removed_at.map(|t| t.timestamp_millis()),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use whisper_shared::protocol::{GroupRecipientEnvelope, RoleChange};
    use whisper_shared::types::MsgType;
    use whisper_shared::ErrorCode;

    use super::*;
    use crate::test_support::{drain, pointer, TestServer, TestUser};

    async fn create(server: &TestServer, owner: &TestUser, members: &[&TestUser]) -> GroupEventPayload {
        let p = GroupCreatePayload {
            session_token: None,
            title: "  Friends  ".to_string(),
            member_ids: members.iter().map(|m| m.whisper_id.clone()).collect(),
        };
        server.state.groups.create_group(&owner.whisper_id, &p).await.unwrap()
    }

    fn update(group_id: &str) -> GroupUpdatePayload {
        GroupUpdatePayload {
            session_token: None,
            group_id: group_id.to_string(),
            ..Default::default()
        }
    }

    fn group_message(from: &TestUser, group_id: &str, mid: &str, to: &[&TestUser]) -> GroupSendMessagePayload {
        let timestamp = Utc::now().timestamp_millis();
        let recipients = to
            .iter()
            .map(|r| {
                let nonce = whisper_shared::crypto::encode_b64(&[7u8; 24]);
                let ciphertext = whisper_shared::crypto::encode_b64(format!("for {}", r.whisper_id).as_bytes());
                let sig = from.keys.sign_envelope(
                    "group_send_message",
                    mid,
                    &from.whisper_id,
                    group_id,
                    timestamp,
                    &nonce,
                    &ciphertext,
                );
                GroupRecipientEnvelope {
                    to: r.whisper_id.clone(),
                    nonce,
                    ciphertext,
                    sig,
                    attachment: None,
                }
            })
            .collect();
        GroupSendMessagePayload {
            session_token: None,
            group_id: group_id.to_string(),
            message_id: mid.to_string(),
            from: from.whisper_id.clone(),
            msg_type: MsgType::Text,
            timestamp,
            recipients,
            reply_to: None,
            reactions: None,
        }
    }

    #[tokio::test]
    async fn test_create_notifies_other_members() {
        let server = TestServer::new().await;
        let alice = server.register().await;
        let bob = server.register().await;
        let (_a, mut alice_rx) = server.connect(&alice).await;
        let (_b, mut bob_rx) = server.connect(&bob).await;

        let event = create(&server, &alice, &[&bob, &bob, &alice]).await;
        assert_eq!(event.group.title, "Friends");
        assert_eq!(event.group.members.len(), 2, "duplicates and creator collapse");
        assert_eq!(event.group.members[0].role, Role::Owner);

        assert!(drain(&mut alice_rx).is_empty(), "creator gets the reply only");
        assert!(matches!(
            &drain(&mut bob_rx)[..],
            [ServerMessage::GroupEvent(e)] if e.event == GroupEventKind::Created
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_member() {
        let server = TestServer::new().await;
        let alice = server.register().await;
        let p = GroupCreatePayload {
            session_token: None,
            title: "Friends".to_string(),
            member_ids: vec!["WSP-ZZZZ-ZZZZ-ZZZZ".to_string()],
        };
        let err = server.state.groups.create_group(&alice.whisper_id, &p).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_only_owner_changes_roles() {
        let server = TestServer::new().await;
        let alice = server.register().await;
        let bob = server.register().await;
        let carol = server.register().await;
        let group = create(&server, &alice, &[&bob, &carol]).await.group;
        let groups = &server.state.groups;

        let mut promote = update(&group.group_id);
        promote.role_changes = vec![RoleChange {
            whisper_id: bob.whisper_id.clone(),
            role: Role::Admin,
        }];
        groups.update_group(&alice.whisper_id, &promote).await.unwrap();

        // An admin may manage the roster but not roles.
        let mut demote = update(&group.group_id);
        demote.role_changes = vec![RoleChange {
            whisper_id: carol.whisper_id.clone(),
            role: Role::Admin,
        }];
        let err = groups.update_group(&bob.whisper_id, &demote).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);

        let mut target_owner = update(&group.group_id);
        target_owner.role_changes = vec![RoleChange {
            whisper_id: alice.whisper_id.clone(),
            role: Role::Member,
        }];
        let err = groups.update_group(&alice.whisper_id, &target_owner).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);

        let mut crown = update(&group.group_id);
        crown.role_changes = vec![RoleChange {
            whisper_id: carol.whisper_id.clone(),
            role: Role::Owner,
        }];
        let err = groups.update_group(&alice.whisper_id, &crown).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);
    }

    #[tokio::test]
    async fn test_remove_notifies_removed_member_and_readd_resets_role() {
        let server = TestServer::new().await;
        let alice = server.register().await;
        let bob = server.register().await;
        let group = create(&server, &alice, &[&bob]).await.group;
        let groups = &server.state.groups;

        let mut promote = update(&group.group_id);
        promote.role_changes = vec![RoleChange {
            whisper_id: bob.whisper_id.clone(),
            role: Role::Admin,
        }];
        groups.update_group(&alice.whisper_id, &promote).await.unwrap();

        let (_b, mut bob_rx) = server.connect(&bob).await;
        let mut remove = update(&group.group_id);
        remove.remove_members = vec![bob.whisper_id.clone()];
        let event = groups.update_group(&alice.whisper_id, &remove).await.unwrap();
        let removed = event
            .group
            .members
            .iter()
            .find(|m| m.whisper_id == bob.whisper_id)
            .unwrap();
        assert!(removed.removed_at.is_some());
        assert_eq!(drain(&mut bob_rx).len(), 1, "removed member hears about it");

        let mut readd = update(&group.group_id);
        readd.add_members = vec![bob.whisper_id.clone()];
        let event = groups.update_group(&alice.whisper_id, &readd).await.unwrap();
        let back = event
            .group
            .members
            .iter()
            .find(|m| m.whisper_id == bob.whisper_id)
            .unwrap();
        assert_eq!(back.role, Role::Member);
        assert!(back.removed_at.is_none());
    }

    #[tokio::test]
    async fn test_member_may_leave_but_not_remove_others() {
        let server = TestServer::new().await;
        let alice = server.register().await;
        let bob = server.register().await;
        let carol = server.register().await;
        let group = create(&server, &alice, &[&bob, &carol]).await.group;
        let groups = &server.state.groups;

        let mut kick = update(&group.group_id);
        kick.remove_members = vec![carol.whisper_id.clone()];
        let err = groups.update_group(&bob.whisper_id, &kick).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);

        let mut leave = update(&group.group_id);
        leave.remove_members = vec![bob.whisper_id.clone()];
        groups.update_group(&bob.whisper_id, &leave).await.unwrap();

        let mut owner_leaves = update(&group.group_id);
        owner_leaves.remove_members = vec![alice.whisper_id.clone()];
        let err = groups.update_group(&alice.whisper_id, &owner_leaves).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);

        // Bob is gone now.
        let mut rename = update(&group.group_id);
        rename.title = Some("Renamed".to_string());
        let err = groups.update_group(&bob.whisper_id, &rename).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
    }

    #[tokio::test]
    async fn test_failed_update_leaves_roster_unchanged() {
        let server = TestServer::new().await;
        let alice = server.register().await;
        let bob = server.register().await;
        let group = create(&server, &alice, &[&bob]).await.group;

        let mut bad = update(&group.group_id);
        bad.title = Some("Renamed".to_string());
        bad.remove_members = vec![bob.whisper_id.clone()];
        bad.role_changes = vec![RoleChange {
            whisper_id: "WSP-ZZZZ-ZZZZ-ZZZZ".to_string(),
            role: Role::Admin,
        }];
        let err = server
            .state
            .groups
            .update_group(&alice.whisper_id, &bad)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);

        let gid = group.group_id.clone();
        let (stored, members) = server
            .state
            .db
            .call(move |db| Ok((db.get_group(&gid)?.unwrap(), db.list_members(&gid, false)?)))
            .await
            .unwrap();
        assert_eq!(stored.title, "Friends");
        assert_eq!(members.len(), 2);
    }

    #[tokio::test]
    async fn test_fanout_counts_online_and_queued() {
        let server = TestServer::new().await;
        let alice = server.register().await;
        let bob = server.register().await;
        let carol = server.register().await;
        let dave = server.register().await;
        let group = create(&server, &alice, &[&bob, &carol, &dave]).await.group;
        let (_b, mut bob_rx) = server.connect(&bob).await;

        let p = group_message(&alice, &group.group_id, "g-1", &[&bob, &carol, &dave]);
        server.state.groups.send_group_message(&alice.whisper_id, &p).await.unwrap();
        // Resend of the whole batch is a no-op.
        server.state.groups.send_group_message(&alice.whisper_id, &p).await.unwrap();

        let live = drain(&mut bob_rx);
        assert_eq!(live.len(), 1);
        assert!(matches!(
            &live[0],
            ServerMessage::MessageReceived(m) if m.group_id.as_deref() == Some(group.group_id.as_str())
        ));
        for offline in [&carol, &dave] {
            let page = server.state.router.fetch_pending(&offline.whisper_id, None, None);
            assert_eq!(page.messages.len(), 1);
            assert_eq!(page.messages[0].to, offline.whisper_id);
        }
    }

    #[tokio::test]
    async fn test_batch_rejected_for_non_member_recipient() {
        let server = TestServer::new().await;
        let alice = server.register().await;
        let bob = server.register().await;
        let mallory = server.register().await;
        let group = create(&server, &alice, &[&bob]).await.group;

        let p = group_message(&alice, &group.group_id, "g-1", &[&bob, &mallory]);
        let err = server
            .state
            .groups
            .send_group_message(&alice.whisper_id, &p)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
        assert!(server.state.router.fetch_pending(&bob.whisper_id, None, None).messages.is_empty());

        let p = group_message(&mallory, &group.group_id, "g-2", &[&bob]);
        let err = server
            .state
            .groups
            .send_group_message(&mallory.whisper_id, &p)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
    }

    #[tokio::test]
    async fn test_batch_naming_removed_member_is_rejected() {
        let server = TestServer::new().await;
        let alice = server.register().await;
        let bob = server.register().await;
        let carol = server.register().await;
        let group = create(&server, &alice, &[&bob, &carol]).await.group;

        let mut remove = update(&group.group_id);
        remove.remove_members = vec![carol.whisper_id.clone()];
        server.state.groups.update_group(&alice.whisper_id, &remove).await.unwrap();
        let (_c, mut carol_rx) = server.connect(&carol).await;

        let p = group_message(&alice, &group.group_id, "g-1", &[&bob, &carol]);
        let err = server
            .state
            .groups
            .send_group_message(&alice.whisper_id, &p)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
        for member in [&bob, &carol] {
            let page = server.state.router.fetch_pending(&member.whisper_id, None, None);
            assert!(page.messages.is_empty());
        }
        assert!(drain(&mut carol_rx).is_empty());

        // The removed member cannot send to the group either.
        let p = group_message(&carol, &group.group_id, "g-2", &[&alice]);
        let err = server
            .state
            .groups
            .send_group_message(&carol.whisper_id, &p)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
    }

    #[tokio::test]
    async fn test_failed_grant_stops_batch_and_retry_delivers_all() {
        let server = TestServer::new().await;
        let alice = server.register().await;
        let bob = server.register().await;
        let carol = server.register().await;
        let group = create(&server, &alice, &[&bob, &carol]).await.group;
        let key = server
            .state
            .attachments
            .upload(&alice.whisper_id, "image/png", b"sealed")
            .await
            .unwrap();
        let mut p = group_message(&alice, &group.group_id, "g-1", &[&bob, &carol]);
        for r in &mut p.recipients {
            r.attachment = Some(pointer(&key));
        }

        server.refuse_writes("attachment_grants").await;
        let err = server
            .state
            .groups
            .send_group_message(&alice.whisper_id, &p)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InternalError);
        for member in [&bob, &carol] {
            let page = server.state.router.fetch_pending(&member.whisper_id, None, None);
            assert!(page.messages.is_empty(), "nobody receives a failed batch");
        }

        server.allow_writes("attachment_grants").await;
        server.state.groups.send_group_message(&alice.whisper_id, &p).await.unwrap();
        for member in [&bob, &carol] {
            let page = server.state.router.fetch_pending(&member.whisper_id, None, None);
            assert_eq!(page.messages.len(), 1);
            assert!(server.state.attachments.exists(&key, &member.whisper_id).await.unwrap());
        }
    }
}
