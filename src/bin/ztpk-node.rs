//! Demo CLI: runs the grid-commitment happy path (S1) end to end between
//! two in-process engines and prints every transition.

use std::collections::BTreeSet;

use tracing_subscriber::EnvFilter;
use ztpk::commitment::{GridCommitment, GridQuery};
use ztpk::hash::Identity;
use ztpk::options::EngineOptions;
use ztpk::protocol::Engine;

fn now_ms(base: u64, step: &mut u64) -> u64 {
    *step += 1;
    base + *step
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ztpk=info")))
        .init();

    let mut clock = 0u64;
    let base = 1_700_000_000_000u64;
    let options = EngineOptions::default();

    let alice_scheme = GridCommitment::new(4, BTreeSet::from([(0, 0), (2, 1)]), b"alice-seed".to_vec());
    let bob_scheme = GridCommitment::new(4, BTreeSet::from([(3, 3)]), b"bob-seed".to_vec());

    let mut alice = Engine::new(Identity::generate(), alice_scheme, now_ms(base, &mut clock), &options)?;
    let mut bob = Engine::new(Identity::generate(), bob_scheme, now_ms(base, &mut clock), &options)?;

    println!("alice: {}", alice.self_id());
    println!("bob:   {}", bob.self_id());

    let alice_public = alice.set_self_commitment(now_ms(base, &mut clock))?;
    let bob_public = bob.set_self_commitment(now_ms(base, &mut clock))?;
    println!("alice root: {}", alice_public.root);
    println!("bob root:   {}", bob_public.root);

    let alice_commit_tx = alice.ledger().pending().first().cloned().expect("alice commit tx pending");
    let bob_commit_tx = bob.ledger().pending().first().cloned().expect("bob commit tx pending");
    bob.set_peer_commitment(alice_public, alice_commit_tx, now_ms(base, &mut clock))?;
    alice.set_peer_commitment(bob_public, bob_commit_tx, now_ms(base, &mut clock))?;

    println!("phase: alice={:?} bob={:?}", alice.phase(), bob.phase());

    let alice_turn = alice.turn() == Some(alice.self_id());
    let (active, other, active_name) = if alice_turn { (&mut alice, &mut bob, "alice") } else { (&mut bob, &mut alice, "bob") };
    println!("{active_name} moves first");

    // bob's only marked cell is (3, 3); alice's are (0, 0) and (2, 1). Query
    // whichever cell the responder actually has marked so the happy path
    // always lands on a genuine hit, regardless of who moves first.
    let query = if alice_turn { GridQuery { x: 3, y: 3 } } else { GridQuery { x: 0, y: 0 } };
    let action = active.record_self_action(
        "q1",
        "query",
        serde_json::json!({ "x": query.x, "y": query.y }),
        now_ms(base, &mut clock),
        5_000,
    )?;
    other.verify_peer_action(action, now_ms(base, &mut clock))?;

    let (proof, _wrapper) = other.generate_proof(query, now_ms(base, &mut clock))?;
    let response = other.record_self_response(serde_json::json!({ "hit": true }), Some(&proof), now_ms(base, &mut clock))?;
    active.verify_peer_response(response, Some(query), Some(true), now_ms(base, &mut clock))?;

    println!("ledger verifies (active): {:?}", active.verify_ledger()?);
    println!("ledger verifies (other):  {:?}", other.verify_ledger()?);
    println!("blocks sealed so far: {}", active.ledger().blocks().len());

    Ok(())
}
