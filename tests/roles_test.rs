use std::sync::Arc;

use citygate::{
    error::RoleError, ConnectionState, ConnectionSupervisor, LifecycleRoles, LifecycleTag,
    MemberRoleState, RoleConsistencyEngine,
};
use gateway::{
    types::{GuildId, RoleId, UserId},
    MemoryGateway, RoleMutation,
};

const GUILD: GuildId = GuildId(700);
const MEMBER: UserId = UserId(42);
const OUTSIDER: RoleId = RoleId(1);
const ASSOCIATE: RoleId = RoleId(2);
const ROLES: LifecycleRoles = LifecycleRoles {
    outsider: OUTSIDER,
    associate: ASSOCIATE,
};

async fn connected_engine() -> (Arc<MemoryGateway>, RoleConsistencyEngine<MemoryGateway>) {
    let gateway = Arc::new(MemoryGateway::new());
    let supervisor = ConnectionSupervisor::new(gateway.clone());
    supervisor.connect().await.expect("connect");
    let engine = RoleConsistencyEngine::new(gateway.clone(), Some(ROLES), supervisor.status());
    (gateway, engine)
}

fn held(gateway: &MemoryGateway) -> Vec<RoleId> {
    let mut roles = gateway.member_roles(GUILD, MEMBER).expect("member present");
    roles.sort();
    roles
}

#[tokio::test]
async fn test_reconcile_drops_outsider_when_both_held() {
    let (gateway, engine) = connected_engine().await;
    gateway.set_member_roles(GUILD, MEMBER, vec![OUTSIDER, ASSOCIATE]);

    let state = engine.reconcile(GUILD, MEMBER).await.expect("reconcile");

    assert_eq!(state, MemberRoleState::Associate);
    assert_eq!(held(&gateway), vec![ASSOCIATE]);
    assert_eq!(
        gateway.role_mutations(),
        vec![RoleMutation::Removed {
            guild: GUILD,
            user: MEMBER,
            role: OUTSIDER
        }]
    );
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let (gateway, engine) = connected_engine().await;
    gateway.set_member_roles(GUILD, MEMBER, vec![OUTSIDER, ASSOCIATE, RoleId(9)]);

    let first = engine.reconcile(GUILD, MEMBER).await.expect("first");
    let mutations = gateway.role_mutations().len();
    let second = engine.reconcile(GUILD, MEMBER).await.expect("second");

    assert_eq!(first, second);
    assert_eq!(gateway.role_mutations().len(), mutations);
    assert_eq!(held(&gateway), vec![ASSOCIATE, RoleId(9)]);
}

#[tokio::test]
async fn test_reconcile_leaves_consistent_states_alone() {
    let (gateway, engine) = connected_engine().await;
    for (roles, expected) in [
        (vec![OUTSIDER], MemberRoleState::Outsider),
        (vec![ASSOCIATE], MemberRoleState::Associate),
        (vec![], MemberRoleState::Neither),
    ] {
        gateway.set_member_roles(GUILD, MEMBER, roles);
        let state = engine.reconcile(GUILD, MEMBER).await.expect("reconcile");
        assert_eq!(state, expected);
    }
    assert!(gateway.role_mutations().is_empty());
}

#[tokio::test]
async fn test_promote_is_idempotent_from_every_state() {
    for start in [
        vec![OUTSIDER],
        vec![ASSOCIATE],
        vec![OUTSIDER, ASSOCIATE],
        vec![],
    ] {
        let (gateway, engine) = connected_engine().await;
        gateway.set_member_roles(GUILD, MEMBER, start.clone());

        let state = engine
            .promote_to_associate(GUILD, MEMBER)
            .await
            .expect("promote");
        assert_eq!(state, MemberRoleState::Associate, "starting from {start:?}");
        assert_eq!(held(&gateway), vec![ASSOCIATE], "starting from {start:?}");

        // Second promotion changes nothing
        let mutations = gateway.role_mutations().len();
        let again = engine
            .promote_to_associate(GUILD, MEMBER)
            .await
            .expect("promote again");
        assert_eq!(again, MemberRoleState::Associate);
        assert_eq!(gateway.role_mutations().len(), mutations);
    }
}

#[tokio::test]
async fn test_grant_and_revoke_are_idempotent() {
    let (gateway, engine) = connected_engine().await;
    gateway.set_member_roles(GUILD, MEMBER, vec![]);

    engine
        .grant(GUILD, MEMBER, LifecycleTag::Outsider)
        .await
        .expect("grant");
    engine
        .grant(GUILD, MEMBER, LifecycleTag::Outsider)
        .await
        .expect("grant again");
    assert_eq!(held(&gateway), vec![OUTSIDER]);

    engine
        .revoke(GUILD, MEMBER, LifecycleTag::Outsider)
        .await
        .expect("revoke");
    let state = engine
        .revoke(GUILD, MEMBER, LifecycleTag::Outsider)
        .await
        .expect("revoke again");
    assert_eq!(state, MemberRoleState::Neither);
    assert_eq!(gateway.role_mutations().len(), 2);
}

#[tokio::test]
async fn test_vanished_member_counts_as_success() {
    let (gateway, engine) = connected_engine().await;

    let state = engine
        .promote_to_associate(GUILD, MEMBER)
        .await
        .expect("promotion of a departed member is not an error");

    assert_eq!(state, MemberRoleState::Neither);
    assert!(gateway.role_mutations().is_empty());
}

#[tokio::test]
async fn test_vanished_role_falls_through_to_reread() {
    let (gateway, engine) = connected_engine().await;
    gateway.set_member_roles(GUILD, MEMBER, vec![OUTSIDER]);
    // Catalogue no longer contains the associate role
    gateway.set_guild_roles(GUILD, vec![gateway::types::Role::new(OUTSIDER, "Outsider", 1)]);

    let state = engine
        .grant(GUILD, MEMBER, LifecycleTag::Associate)
        .await
        .expect("missing role is tolerated");

    assert_eq!(state, MemberRoleState::Outsider);
}

#[tokio::test]
async fn test_role_operations_fail_fast_while_disconnected() {
    let gateway = Arc::new(MemoryGateway::new());
    let supervisor = ConnectionSupervisor::new(gateway.clone());
    let engine = RoleConsistencyEngine::new(gateway.clone(), Some(ROLES), supervisor.status());
    gateway.set_member_roles(GUILD, MEMBER, vec![OUTSIDER]);

    let err = engine
        .promote_to_associate(GUILD, MEMBER)
        .await
        .expect_err("not connected");

    assert!(matches!(
        err,
        RoleError::Unavailable(ConnectionState::Disconnected)
    ));
    assert!(gateway.role_mutations().is_empty());
}

#[tokio::test]
async fn test_unconfigured_roles_are_reported() {
    let gateway = Arc::new(MemoryGateway::new());
    let supervisor = ConnectionSupervisor::new(gateway.clone());
    supervisor.connect().await.expect("connect");
    let engine = RoleConsistencyEngine::new(gateway.clone(), None, supervisor.status());

    let err = engine.reconcile(GUILD, MEMBER).await.expect_err("no roles");
    assert!(matches!(err, RoleError::NotConfigured));
}
