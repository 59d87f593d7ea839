use criterion::{criterion_group, criterion_main, Criterion};
use rtc_session_core::webrtc::signaling::{next_state, DescriptionSide, SignalingParser};
use rtc_session_core::webrtc::{SdpType, SignalingState};
use rtc_session_core::{HandleId, HandleTable};
use std::hint::black_box;

fn bench_handle_table(c: &mut Criterion) {
    let table: HandleTable<u64> = HandleTable::new();
    let ids: Vec<HandleId> = (0..1024).map(|_| HandleId::next()).collect();
    let live: Vec<_> = ids
        .iter()
        .map(|id| table.find_or_create(*id, |h| h.as_u64()).expect("table open"))
        .collect();

    c.bench_function("handle_table_find_existing", |b| {
        let mut i = 0;
        b.iter(|| {
            let id = ids[i % ids.len()];
            i += 1;
            black_box(table.find_or_create(id, |h| h.as_u64()).expect("table open"));
        })
    });

    c.bench_function("handle_table_create_and_remove", |b| {
        b.iter(|| {
            let id = HandleId::next();
            let wrapper = table.find_or_create(id, |h| h.as_u64()).expect("table open");
            table.remove(id);
            black_box(wrapper);
        })
    });
    drop(live);
}

fn bench_signaling(c: &mut Criterion) {
    c.bench_function("next_state_offer_answer", |b| {
        b.iter(|| {
            let state = next_state(SignalingState::Stable, DescriptionSide::Local, SdpType::Offer)
                .expect("valid transition");
            black_box(next_state(black_box(state), DescriptionSide::Remote, SdpType::Answer).expect("valid transition"));
        })
    });

    let message = r#"{"type":"offer","sdp":"v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n","session_id":"bench"}"#;
    c.bench_function("signaling_parse_offer", |b| {
        b.iter(|| black_box(SignalingParser::parse(black_box(message)).expect("valid message")))
    });
}

criterion_group!(benches, bench_handle_table, bench_signaling);
criterion_main!(benches);
