//! Encrypted voice between two media services over loopback

use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

use direct_telephony::audio::MemoryBackend;
use direct_telephony::codec::{AesGcmFilter, CipherKey, FilterChain, XorFilter};
use direct_telephony::config::{AudioConfig, Binding, MediaConfig};
use direct_telephony::error::{Error, StateError};
use direct_telephony::events::MediaEvent;
use direct_telephony::network::MediaService;

const WAIT: Duration = Duration::from_secs(5);
const CHUNK: usize = 16;

fn media_config() -> MediaConfig {
    MediaConfig {
        poll_interval_ms: 10,
        exhaustion_frames: 50,
        ..MediaConfig::default()
    }
}

fn audio_config() -> AudioConfig {
    AudioConfig {
        chunk_bytes: CHUNK,
        ..AudioConfig::default()
    }
}

fn aes_chain(key: &CipherKey) -> FilterChain {
    FilterChain::new().with(AesGcmFilter::new(key))
}

fn peer(filters: FilterChain) -> (MediaService, MemoryBackend, Receiver<MediaEvent>) {
    let backend = MemoryBackend::new();
    let (tx, rx) = crossbeam_channel::unbounded();
    let media = MediaService::new(
        media_config(),
        audio_config(),
        filters,
        Arc::new(backend.clone()),
        Arc::new(tx),
    )
    .unwrap();
    (media, backend, rx)
}

fn loopback() -> Binding {
    Binding::fixed("127.0.0.1", 0)
}

/// Collect events until `wanted` matches one
fn wait_for(rx: &Receiver<MediaEvent>, wanted: impl Fn(&MediaEvent) -> bool) -> Vec<MediaEvent> {
    let deadline = Instant::now() + WAIT;
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        if let Ok(event) = rx.recv_timeout(Duration::from_millis(50)) {
            let done = wanted(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }
    panic!("event not seen, got {:?}", seen);
}

fn eventually(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn count(events: &[MediaEvent], wanted: &MediaEvent) -> usize {
    events.iter().filter(|e| *e == wanted).count()
}

#[test]
fn voice_reaches_the_peer_decrypted() {
    let key = CipherKey::generate();
    let (alice, alice_audio, alice_rx) = peer(aes_chain(&key));
    let (bob, bob_audio, bob_rx) = peer(aes_chain(&key));

    alice.start_inbound(loopback()).unwrap();
    bob.start_inbound(loopback()).unwrap();
    let bob_port = bob.inbound_addr().unwrap().port();

    alice_audio.script.feed(&[1u8; CHUNK]);
    alice_audio.script.feed(&[2u8; CHUNK]);
    alice_audio.script.feed(&[3u8; CHUNK]);
    alice.start_outbound("127.0.0.1", bob_port, loopback()).unwrap();
    assert!(alice.is_outbound_launched());

    wait_for(&alice_rx, |e| matches!(e, MediaEvent::OutboundEstablished { .. }));
    assert!(eventually(|| {
        let heard = bob_audio.record.snapshot();
        let at = |tag: u8| heard.windows(CHUNK).position(|w| w == [tag; CHUNK]);
        matches!((at(1), at(2), at(3)), (Some(a), Some(b), Some(c)) if a < b && b < c)
    }));
    assert!(bob.stats().frames_received > 0);
    assert!(alice.stats().frames_sent > 0);

    alice.stop().unwrap();
    bob.stop().unwrap();
    let alice_events = wait_for(&alice_rx, |e| *e == MediaEvent::FullyFinished);
    let bob_events = wait_for(&bob_rx, |e| *e == MediaEvent::FullyFinished);

    assert_eq!(count(&alice_events, &MediaEvent::InboundFinished), 1);
    assert_eq!(count(&alice_events, &MediaEvent::OutboundFinished), 1);
    assert_eq!(count(&bob_events, &MediaEvent::InboundFinished), 1);
    assert!(alice_rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(!alice.is_launched());
    assert!(!bob.is_launched());
}

#[test]
fn both_directions_at_once() {
    let chain = FilterChain::new().with(XorFilter::new(vec![0x5A, 0xC3]));
    let (alice, alice_audio, alice_rx) = peer(chain.clone());
    let (bob, bob_audio, bob_rx) = peer(chain);

    alice.start_inbound(loopback()).unwrap();
    bob.start_inbound(loopback()).unwrap();
    alice_audio.script.feed(&[0x11; CHUNK]);
    bob_audio.script.feed(&[0x22; CHUNK]);

    alice
        .start_outbound("127.0.0.1", bob.inbound_addr().unwrap().port(), loopback())
        .unwrap();
    bob.start_outbound("127.0.0.1", alice.inbound_addr().unwrap().port(), loopback())
        .unwrap();

    assert!(eventually(|| bob_audio.record.contains(&[0x11; CHUNK])));
    assert!(eventually(|| alice_audio.record.contains(&[0x22; CHUNK])));

    assert!(matches!(
        alice.start_outbound("127.0.0.1", 9, loopback()),
        Err(Error::State(StateError::AlreadyLaunched(_)))
    ));

    alice.stop().unwrap();
    bob.stop().unwrap();
    let events = wait_for(&alice_rx, |e| *e == MediaEvent::FullyFinished);
    assert_eq!(count(&events, &MediaEvent::FullyFinished), 1);
    wait_for(&bob_rx, |e| *e == MediaEvent::FullyFinished);
}

#[test]
fn wrong_key_fails_playback_and_stops_the_service() {
    let (alice, alice_audio, alice_rx) = peer(aes_chain(&CipherKey::generate()));
    let (bob, _bob_audio, bob_rx) = peer(aes_chain(&CipherKey::generate()));

    alice.start_inbound(loopback()).unwrap();
    bob.start_inbound(loopback()).unwrap();
    alice_audio.script.feed(&[9u8; CHUNK]);
    alice
        .start_outbound("127.0.0.1", bob.inbound_addr().unwrap().port(), loopback())
        .unwrap();

    let events = wait_for(&bob_rx, |e| *e == MediaEvent::FullyFinished);
    assert!(events.iter().any(|e| matches!(e, MediaEvent::PlayingFailed { .. })));
    assert!(events.contains(&MediaEvent::InboundFinished));
    assert!(!bob.is_launched());

    alice.stop().unwrap();
    wait_for(&alice_rx, |e| *e == MediaEvent::FullyFinished);
}

#[test]
fn inbound_restarts_after_full_stop() {
    let (media, _audio, rx) = peer(FilterChain::new());

    media.start_inbound(loopback()).unwrap();
    media.stop().unwrap();
    wait_for(&rx, |e| *e == MediaEvent::FullyFinished);

    assert!(eventually(|| !media.is_launched()));
    media.start_inbound(loopback()).unwrap();
    assert!(media.is_inbound_launched());
    media.stop().unwrap();
    wait_for(&rx, |e| *e == MediaEvent::FullyFinished);
}

#[test]
fn inbound_on_a_taken_port_fails() {
    let (first, _first_audio, first_rx) = peer(FilterChain::new());
    let (second, _second_audio, _second_rx) = peer(FilterChain::new());

    first.start_inbound(loopback()).unwrap();
    let taken = first.inbound_addr().unwrap().port();

    let result = second.start_inbound(Binding::fixed("127.0.0.1", taken));
    assert!(matches!(result, Err(Error::Network(_))));
    assert!(!second.is_launched());

    first.stop().unwrap();
    wait_for(&first_rx, |e| *e == MediaEvent::FullyFinished);
}
