//! Error Injection Tests
//!
//! Tests error handling paths through simulated failures:
//! - Corrupted, truncated and interleaved frames
//! - Disconnect classification and bond-loss thresholds
//! - Error classification for recovery and user messaging

use pumplink_protocol::config::ReconnectConfig;
use pumplink_protocol::framing::{encode, parse_header, FrameAssembler};
use pumplink_protocol::reconnect::{DisconnectVerdict, SessionSummary};
use pumplink_protocol::{DisconnectReason, ProtocolError, ReconnectPhase, ReconnectPolicy};
use std::time::Duration;

fn reassemble(chunks: &[Vec<u8>]) -> Option<Vec<u8>> {
    let mut assembler = FrameAssembler::new();
    for chunk in chunks {
        if assembler.feed(chunk) {
            return Some(assembler.assemble());
        }
    }
    None
}

/// A flipped cargo bit must fail the checksum
#[test]
fn test_corrupted_frame_rejected() {
    let mut chunks = encode(0x41, 7, &[1, 2, 3, 4, 5, 6, 7, 8], 6).unwrap();
    chunks[1][2] ^= 0x01;

    let raw = reassemble(&chunks).unwrap();
    assert!(parse_header(&raw).is_none());
}

/// A frame missing its middle chunk never yields a frame
#[test]
fn test_dropped_chunk_never_yields_frame() {
    let mut chunks = encode(0x41, 3, &[0xaa; 40], 10).unwrap();
    assert!(chunks.len() > 2);
    chunks.remove(1);

    assert!(reassemble(&chunks).and_then(|raw| parse_header(&raw)).is_none());
}

/// A new frame starting mid-reassembly replaces the partial one
#[test]
fn test_restart_discards_partial_frame() {
    let first = encode(0x41, 1, &[0x11; 30], 10).unwrap();
    let second = encode(0x43, 1, &[0x22; 4], 10).unwrap();

    let mut chunks = vec![first[0].clone()];
    chunks.extend(second);
    let frame = parse_header(&reassemble(&chunks).unwrap()).unwrap();
    assert_eq!(frame.opcode, 0x43);
    assert_eq!(frame.cargo, vec![0x22; 4]);
}

/// Garbage never panics the parser
#[test]
fn test_garbage_input() {
    for len in 0..12 {
        let junk: Vec<u8> = (0..len).map(|i| (i * 37) as u8).collect();
        assert!(parse_header(&junk).is_none());
        let mut assembler = FrameAssembler::new();
        let _ = assembler.feed(&junk);
    }
}

/// Cargo beyond the frame limit is refused at encode time
#[test]
fn test_oversized_cargo_refused() {
    let result = encode(0x41, 0, &[0; 254], 18);
    assert!(matches!(result, Err(ProtocolError::CargoTooLarge(254, 253))));
}

fn before_connected() -> SessionSummary {
    SessionSummary::default()
}

/// Peer-terminated links before any session mean the pump dropped our bond
#[test]
fn test_repeated_peer_termination_is_bond_loss() {
    let mut policy = ReconnectPolicy::new(ReconnectConfig::default());

    for _ in 0..2 {
        assert_eq!(
            policy.classify(DisconnectReason::PeerTerminated, before_connected()),
            DisconnectVerdict::Transient
        );
    }
    assert!(matches!(
        policy.classify(DisconnectReason::PeerTerminated, before_connected()),
        DisconnectVerdict::BondLost(_)
    ));
}

/// After a good session the same disconnects are idle timeouts
#[test]
fn test_peer_termination_after_success_is_transient() {
    let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
    policy.on_authenticated();

    for _ in 0..10 {
        assert_eq!(
            policy.classify(DisconnectReason::PeerTerminated, before_connected()),
            DisconnectVerdict::Transient
        );
    }
}

/// Encryption failures interleaved with other reasons never accumulate
#[test]
fn test_interleaved_encryption_failures_reset() {
    let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
    policy.on_authenticated();

    for _ in 0..5 {
        for _ in 0..3 {
            assert_eq!(
                policy.classify(DisconnectReason::InsufficientEncryption, before_connected()),
                DisconnectVerdict::Transient
            );
        }
        policy.classify(DisconnectReason::ConnectionTimeout, before_connected());
    }
    assert_eq!(policy.budget().encryption_failures, 0);
}

/// The fast schedule adds up to about five minutes before going slow
#[test]
fn test_fast_schedule_then_slow() {
    let mut policy = ReconnectPolicy::new(ReconnectConfig::default());

    let total: Duration = (0..10).map(|_| policy.next_delay()).sum();
    assert_eq!(total, Duration::from_secs(1 + 2 + 4 + 8 + 16 + 32 + 60 * 4));
    assert_eq!(policy.phase(), ReconnectPhase::Fast);

    assert_eq!(policy.next_delay(), Duration::from_secs(60));
    assert_eq!(policy.phase(), ReconnectPhase::Slow);
}

/// Test error classification for recoverable errors
#[test]
fn test_recoverable_error_classification() {
    let error = ProtocolError::Timeout("status request".to_string());
    assert!(error.is_recoverable());
    assert!(!error.requires_user_action());

    let error = ProtocolError::Cancelled("link lost".to_string());
    assert!(error.is_recoverable());

    let error = ProtocolError::transport("write failed");
    assert!(error.is_recoverable());
    assert!(error.user_message().contains("Reconnecting"));
}

/// Test error classification for user action required errors
#[test]
fn test_user_action_required_classification() {
    let error = ProtocolError::NotPaired;
    assert!(!error.is_recoverable());
    assert!(error.requires_user_action());

    let error = ProtocolError::BondLost("pump ignored 3 consecutive sessions".to_string());
    assert!(error.requires_user_action());
    assert!(error.user_message().contains("pair again"));

    let error = ProtocolError::Authentication("wrong code".to_string());
    assert!(error.requires_user_action());
}
