//! Group records and rosters.
//!
//! Membership changes never delete rows: a removed member keeps its row with
//! `removed_at` set, and re-adding it clears the tombstone.

use rusqlite::{params, OptionalExtension, Transaction};

use whisper_shared::types::Role;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Group, GroupMember};
use crate::time::{bad_enum, from_sql, from_sql_opt, to_sql};

impl Database {
    /// Create a group together with its initial roster.
    pub fn create_group(&mut self, group: &Group, members: &[GroupMember]) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO chat_groups (group_id, title, owner_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                group.group_id,
                group.title,
                group.owner_id,
                to_sql(&group.created_at),
                to_sql(&group.updated_at),
            ],
        )
        .map_err(StoreError::from_write)?;
        for member in members {
            upsert_member(&tx, member)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_group(&self, group_id: &str) -> Result<Option<Group>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT group_id, title, owner_id, created_at, updated_at
                 FROM chat_groups WHERE group_id = ?1",
                params![group_id],
                row_to_group,
            )
            .optional()?)
    }

    /// Roster of a group ordered by join time. Tombstoned rows are included
    /// only when `include_removed` is set.
    pub fn list_members(&self, group_id: &str, include_removed: bool) -> Result<Vec<GroupMember>> {
        let sql = if include_removed {
            "SELECT group_id, whisper_id, role, joined_at, removed_at
             FROM group_members WHERE group_id = ?1
             ORDER BY joined_at, whisper_id"
        } else {
            "SELECT group_id, whisper_id, role, joined_at, removed_at
             FROM group_members WHERE group_id = ?1 AND removed_at IS NULL
             ORDER BY joined_at, whisper_id"
        };
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(params![group_id], row_to_member)?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }

    pub fn get_member(&self, group_id: &str, whisper_id: &str) -> Result<Option<GroupMember>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT group_id, whisper_id, role, joined_at, removed_at
                 FROM group_members WHERE group_id = ?1 AND whisper_id = ?2",
                params![group_id, whisper_id],
                row_to_member,
            )
            .optional()?)
    }

    /// Persist a modified group and the roster rows that changed, atomically.
    pub fn save_group(&mut self, group: &Group, changed: &[GroupMember]) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        let updated = tx.execute(
            "UPDATE chat_groups SET title = ?2, updated_at = ?3 WHERE group_id = ?1",
            params![group.group_id, group.title, to_sql(&group.updated_at)],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        for member in changed {
            upsert_member(&tx, member)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Ids of the groups the identity is an active member of.
    pub fn groups_for_member(&self, whisper_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare(
            "SELECT group_id FROM group_members
             WHERE whisper_id = ?1 AND removed_at IS NULL
             ORDER BY group_id",
        )?;
        let rows = stmt.query_map(params![whisper_id], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }
}

fn upsert_member(tx: &Transaction<'_>, member: &GroupMember) -> Result<()> {
    tx.execute(
        "INSERT INTO group_members (group_id, whisper_id, role, joined_at, removed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(group_id, whisper_id) DO UPDATE SET
            role = excluded.role,
            joined_at = excluded.joined_at,
            removed_at = excluded.removed_at",
        params![
            member.group_id,
            member.whisper_id,
            member.role.as_str(),
            to_sql(&member.joined_at),
            member.removed_at.as_ref().map(to_sql),
        ],
    )
    .map_err(StoreError::from_write)?;
    Ok(())
}

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    let created_str: String = row.get(3)?;
    let updated_str: String = row.get(4)?;
    Ok(Group {
        group_id: row.get(0)?,
        title: row.get(1)?,
        owner_id: row.get(2)?,
        created_at: from_sql(3, &created_str)?,
        updated_at: from_sql(4, &updated_str)?,
    })
}

fn row_to_member(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupMember> {
    let role_str: String = row.get(2)?;
    let joined_str: String = row.get(3)?;
    Ok(GroupMember {
        group_id: row.get(0)?,
        whisper_id: row.get(1)?,
        role: Role::parse(&role_str).ok_or_else(|| bad_enum(2, &role_str))?,
        joined_at: from_sql(3, &joined_str)?,
        removed_at: from_sql_opt(4, row.get(4)?)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::identities::tests::identity;

    pub(crate) fn member(group_id: &str, whisper_id: &str, role: Role) -> GroupMember {
        GroupMember {
            group_id: group_id.to_string(),
            whisper_id: whisper_id.to_string(),
            role,
            joined_at: Utc::now(),
            removed_at: None,
        }
    }

    pub(crate) fn seed_group(db: &mut Database) -> Group {
        for (i, id) in ["WSP-AAAA-AAAA-AAAA", "WSP-BBBB-BBBB-BBBB", "WSP-CCCC-CCCC-CCCC"]
            .iter()
            .enumerate()
        {
            db.insert_identity(&identity(id, (i as u8) * 2 + 1)).unwrap();
        }
        let now = Utc::now();
        let group = Group {
            group_id: "g-1".to_string(),
            title: "Friends".to_string(),
            owner_id: "WSP-AAAA-AAAA-AAAA".to_string(),
            created_at: now,
            updated_at: now,
        };
        db.create_group(
            &group,
            &[
                member("g-1", "WSP-AAAA-AAAA-AAAA", Role::Owner),
                member("g-1", "WSP-BBBB-BBBB-BBBB", Role::Member),
            ],
        )
        .unwrap();
        group
    }

    #[test]
    fn create_and_read_roster() {
        let mut db = Database::open_in_memory().unwrap();
        let group = seed_group(&mut db);

        assert_eq!(db.get_group("g-1").unwrap().unwrap(), group);
        let members = db.list_members("g-1", false).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(
            db.get_member("g-1", "WSP-AAAA-AAAA-AAAA").unwrap().unwrap().role,
            Role::Owner
        );
        assert_eq!(db.groups_for_member("WSP-BBBB-BBBB-BBBB").unwrap(), vec!["g-1"]);
    }

    #[test]
    fn removal_keeps_tombstone_and_readd_clears_it() {
        let mut db = Database::open_in_memory().unwrap();
        let mut group = seed_group(&mut db);
        group.updated_at = Utc::now() + Duration::seconds(1);

        let mut removed = member("g-1", "WSP-BBBB-BBBB-BBBB", Role::Member);
        removed.removed_at = Some(Utc::now());
        db.save_group(&group, &[removed]).unwrap();

        assert_eq!(db.list_members("g-1", false).unwrap().len(), 1);
        assert_eq!(db.list_members("g-1", true).unwrap().len(), 2);
        assert!(db.groups_for_member("WSP-BBBB-BBBB-BBBB").unwrap().is_empty());

        db.save_group(&group, &[member("g-1", "WSP-BBBB-BBBB-BBBB", Role::Admin)])
            .unwrap();
        let back = db.get_member("g-1", "WSP-BBBB-BBBB-BBBB").unwrap().unwrap();
        assert!(back.is_active());
        assert_eq!(back.role, Role::Admin);
    }

    #[test]
    fn failed_save_rolls_back() {
        let mut db = Database::open_in_memory().unwrap();
        let mut group = seed_group(&mut db);
        group.title = "Renamed".to_string();

        // Unknown identity violates the roster foreign key.
        let result = db.save_group(
            &group,
            &[
                member("g-1", "WSP-CCCC-CCCC-CCCC", Role::Member),
                member("g-1", "WSP-ZZZZ-ZZZZ-ZZZZ", Role::Member),
            ],
        );
        assert!(result.is_err());
        assert_eq!(db.get_group("g-1").unwrap().unwrap().title, "Friends");
        assert!(db.get_member("g-1", "WSP-CCCC-CCCC-CCCC").unwrap().is_none());
    }
}
