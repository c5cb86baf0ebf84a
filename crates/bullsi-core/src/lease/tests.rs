//! 租约状态机测试
//!
//! 覆盖 claim / hold / 网络标识请求 / wipe / status 以及过期清扫

use super::*;
use rand::SeedableRng;
use rand::rngs::StdRng;

const WINDOW: u64 = 3_000;

fn manager_at(now: u64) -> LeaseManager {
    LeaseManager::new("Ab3dEf9h", now, WINDOW)
}

// ============================================================================
// 生成与状态
// ============================================================================

#[test]
fn test_generated_secret_shape() {
    let mut rng = StdRng::seed_from_u64(7);
    let manager = LeaseManager::generate(&mut rng, 0, WINDOW);

    assert_eq!(manager.secret().len(), SECRET_LEN);
    assert!(manager.secret().chars().all(|c| c.is_ascii_alphanumeric()));
    assert_eq!(manager.status(0), LeaseStatus::Claimed);
}

#[test]
fn test_random_token_length() {
    let mut rng = StdRng::seed_from_u64(42);
    let name = random_token(&mut rng, NETWORK_NAME_LEN);
    assert_eq!(name.len(), NETWORK_NAME_LEN);
    assert!(name.chars().all(|c| c.is_ascii_alphanumeric()));
}

#[test]
fn test_status_strings() {
    assert_eq!(LeaseStatus::Claimed.as_str(), "claimed");
    assert_eq!(LeaseStatus::Unclaimed.to_string(), "unclaimed");
    assert_eq!(
        serde_json::to_string(&LeaseStatus::Unclaimed).unwrap(),
        "\"unclaimed\""
    );
}

#[test]
fn test_derive_status() {
    assert_eq!(derive_status("", 0, WINDOW, 0), LeaseStatus::Unclaimed);
    assert_eq!(derive_status("x", 0, WINDOW, WINDOW), LeaseStatus::Claimed);
    assert_eq!(
        derive_status("x", 0, WINDOW, WINDOW + 1),
        LeaseStatus::Unclaimed
    );
    // 窗口为 0 时永不过期
    assert_eq!(derive_status("x", 0, 0, u64::MAX), LeaseStatus::Claimed);
}

#[test]
fn test_status_is_lazy_and_does_not_mutate() {
    let manager = manager_at(100);
    assert_eq!(manager.status(100 + WINDOW + 1), LeaseStatus::Unclaimed);

    // 读取不会清除密钥或计时
    assert_eq!(manager.secret(), "Ab3dEf9h");
    assert_eq!(manager.issued_at_ms(), 100);
    assert_eq!(manager.status(100 + WINDOW), LeaseStatus::Claimed);
}

// ============================================================================
// claim
// ============================================================================

#[test]
fn test_claim_returns_secret_unconditionally() {
    let mut manager = manager_at(0);

    for now in [0, 10, WINDOW + 500] {
        let outcome = manager.process(&Command::Claim, now).unwrap();
        assert_eq!(outcome, CommandOutcome::Secret("Ab3dEf9h".to_string()));
    }
    // 过期后的 claim 仍返回密钥，但不刷新计时
    assert_eq!(manager.issued_at_ms(), 10);
    assert_eq!(manager.status(WINDOW + 500), LeaseStatus::Unclaimed);
}

#[test]
fn test_claim_refreshes_timer() {
    let mut manager = manager_at(0);

    manager.process(&Command::Claim, 2_500).unwrap();
    assert_eq!(manager.issued_at_ms(), 2_500);
    assert_eq!(manager.status(4_000), LeaseStatus::Claimed);
    assert!(!manager.sweep(4_000));
}

#[test]
fn test_claim_after_sweep_does_not_revive() {
    let mut manager = manager_at(0);
    assert!(manager.sweep(WINDOW + 1));

    let outcome = manager.process(&Command::Claim, WINDOW + 2).unwrap();
    assert_eq!(outcome, CommandOutcome::Secret(String::new()));
    assert_eq!(manager.issued_at_ms(), 0);
    assert_eq!(manager.status(WINDOW + 2), LeaseStatus::Unclaimed);
}

#[test]
fn test_status_query_command() {
    let mut manager = manager_at(0);
    assert_eq!(
        manager.process(&Command::StatusQuery, 5).unwrap(),
        CommandOutcome::Status(LeaseStatus::Claimed)
    );
    assert_eq!(
        manager.process(&Command::StatusQuery, WINDOW + 5).unwrap(),
        CommandOutcome::Status(LeaseStatus::Unclaimed)
    );
}

// ============================================================================
// hold
// ============================================================================

#[test]
fn test_hold_refreshes_timer() {
    let mut manager = manager_at(0);

    let outcome = manager
        .process(&Command::Hold("Ab3dEf9h".to_string()), 2_000)
        .unwrap();
    assert_eq!(outcome, CommandOutcome::Refreshed);
    assert_eq!(manager.issued_at_ms(), 2_000);
}

#[test]
fn test_hold_keeps_lease_alive_indefinitely() {
    let mut manager = manager_at(0);
    let mut now = 0;

    for _ in 0..50 {
        now += WINDOW - 1;
        assert!(!manager.sweep(now));
        manager
            .process(&Command::Hold("Ab3dEf9h".to_string()), now)
            .unwrap();
        assert_eq!(manager.status(now), LeaseStatus::Claimed);
    }
}

#[test]
fn test_hold_mismatch() {
    let mut manager = manager_at(0);

    let denial = manager
        .process(&Command::Hold("ab3def9h".to_string()), 10)
        .unwrap_err();
    assert_eq!(denial, Denial::Mismatch);
    // 拒绝不刷新计时
    assert_eq!(manager.issued_at_ms(), 0);
}

#[test]
fn test_hold_after_window_is_expired_without_refresh() {
    let mut manager = manager_at(0);
    let late = WINDOW + 1;

    let denial = manager
        .process(&Command::Hold("Ab3dEf9h".to_string()), late)
        .unwrap_err();
    assert_eq!(denial, Denial::Expired);
    assert_eq!(manager.issued_at_ms(), 0);
    // 拒绝不会隐式清除密钥
    assert_eq!(manager.secret(), "Ab3dEf9h");

    // 下一次清扫才清除
    assert!(manager.sweep(late));
    assert_eq!(manager.secret(), "");
    assert_eq!(manager.issued_at_ms(), 0);
    assert_eq!(manager.status(late), LeaseStatus::Unclaimed);
}

#[test]
fn test_expired_takes_precedence_over_mismatch() {
    let mut manager = manager_at(0);
    let denial = manager.authorize("wrong", WINDOW + 1).unwrap_err();
    assert_eq!(denial, Denial::Expired);
}

#[test]
fn test_window_boundary_is_strict() {
    let mut manager = manager_at(0);
    // 恰好等于窗口时仍然有效
    assert!(manager.authorize("Ab3dEf9h", WINDOW).is_ok());
}

// ============================================================================
// 清扫后
// ============================================================================

#[test]
fn test_after_sweep_all_commands_uninitialized() {
    let mut manager = manager_at(0);
    assert!(manager.sweep(WINDOW + 1));

    let old = "Ab3dEf9h".to_string();
    let commands = [
        Command::Hold(old.clone()),
        Command::NetworkIdentityRequest(old.clone()),
        Command::Wipe(old),
    ];
    for command in &commands {
        let denial = manager.process(command, WINDOW + 2).unwrap_err();
        assert_eq!(denial, Denial::Uninitialized, "{}", command.name());
    }

    // claim 此时返回空密钥
    assert_eq!(
        manager.process(&Command::Claim, WINDOW + 3).unwrap(),
        CommandOutcome::Secret(String::new())
    );
}

#[test]
fn test_sweep_only_clears_once() {
    let mut manager = manager_at(0);
    assert!(!manager.sweep(WINDOW));
    assert!(manager.sweep(WINDOW + 1));
    assert!(!manager.sweep(WINDOW + 2));
}

#[test]
fn test_zero_window_disables_expiration() {
    let mut manager = LeaseManager::new("Ab3dEf9h", 0, 0);
    assert!(!manager.sweep(u64::MAX / 2));
    assert_eq!(manager.status(u64::MAX / 2), LeaseStatus::Claimed);
    assert!(manager.authorize("Ab3dEf9h", u64::MAX / 2).is_ok());
}

#[test]
fn test_empty_secret_is_uninitialized() {
    let mut manager = LeaseManager::new("", 0, WINDOW);
    assert_eq!(manager.authorize("", 1).unwrap_err(), Denial::Uninitialized);
    assert_eq!(manager.status(1), LeaseStatus::Unclaimed);
}

// ============================================================================
// 网络标识请求与 wipe
// ============================================================================

#[test]
fn test_network_identity_request_authorized() {
    let mut manager = manager_at(0);
    assert_eq!(
        manager
            .process(
                &Command::NetworkIdentityRequest("Ab3dEf9h".to_string()),
                1_500
            )
            .unwrap(),
        CommandOutcome::NetworkIdentityGranted
    );
    assert_eq!(manager.issued_at_ms(), 1_500);
}

#[test]
fn test_wipe_authorization() {
    let mut manager = manager_at(0);

    assert_eq!(
        manager
            .process(&Command::Wipe("nope".to_string()), 10)
            .unwrap_err(),
        Denial::Mismatch
    );
    assert_eq!(
        manager
            .process(&Command::Wipe("Ab3dEf9h".to_string()), 20)
            .unwrap(),
        CommandOutcome::WipeAuthorized
    );
}

// ============================================================================
// 时钟
// ============================================================================

#[test]
fn test_manual_clock_shared_between_clones() {
    let clock = ManualClock::new(10);
    let other = clock.clone();

    clock.advance(5);
    assert_eq!(other.now_ms(), 15);
    other.set(100);
    assert_eq!(clock.now_ms(), 100);
}

#[test]
fn test_monotonic_clock_does_not_go_backwards() {
    let clock = MonotonicClock::new();
    let a = clock.now_ms();
    let b = clock.now_ms();
    assert!(b >= a);
}
