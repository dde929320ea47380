use criterion::{criterion_group, criterion_main, Criterion};
use inkroom_collab::{
    Frame, JoinRequest, LocalTransport, RelayConfig, RelayHub, RoomEvent, Transport,
};
use inkroom_core::{CameraState, MemberState};
use serde_json::json;
use std::hint::black_box;
use uuid::Uuid;

fn bench_frame_encode(c: &mut Criterion) {
    let room = Uuid::new_v4();
    let event = RoomEvent::Camera {
        camera: CameraState {
            center_x: 512.0,
            center_y: -128.0,
            scale: 1.5,
        },
    };

    c.bench_function("frame_encode_camera", |b| {
        b.iter(|| {
            let frame = Frame::new(black_box(7), black_box(room), black_box(42), &event).unwrap();
            black_box(frame.encode().unwrap());
        })
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let room = Uuid::new_v4();
    let patch = json!({ "slide": 3, "timer": { "running": true, "left": 90 } });
    let event = RoomEvent::GlobalPatch {
        patch: patch.as_object().cloned().unwrap(),
    };
    let encoded = Frame::new(7, room, 42, &event).unwrap().encode().unwrap();

    c.bench_function("frame_decode_global_patch", |b| {
        b.iter(|| {
            let frame = Frame::decode(black_box(&encoded)).unwrap();
            black_box(frame.event().unwrap());
        })
    });
}

fn joined(hub: &std::sync::Arc<RelayHub>, room: Uuid) -> LocalTransport {
    let mut transport = hub.connect(room).unwrap();
    let join = RoomEvent::Join(JoinRequest {
        writable: true,
        member_state: MemberState::default(),
        payload: None,
    });
    transport
        .send(Frame::new(0, room, 0, &join).unwrap().encode().unwrap())
        .unwrap();
    while transport.try_recv().is_some() {}
    transport
}

fn bench_relay_fanout(c: &mut Criterion) {
    let hub = RelayHub::new(RelayConfig {
        broadcast_capacity: 4096,
        ..RelayConfig::default()
    });
    let room = Uuid::new_v4();
    let mut peers: Vec<_> = (0..10).map(|_| joined(&hub, room)).collect();
    for peer in &mut peers {
        while peer.try_recv().is_some() {}
    }
    let frame = Frame::new(0, room, 1, &RoomEvent::ScenePointer { path: "/init".into() })
        .unwrap()
        .encode()
        .unwrap();

    c.bench_function("relay_fanout_1k_frames_10_members", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                peers[0].send(frame.clone()).unwrap();
            }
            for peer in &mut peers {
                while let Some(event) = peer.try_recv() {
                    black_box(event);
                }
            }
        })
    });
}

criterion_group!(benches, bench_frame_encode, bench_frame_decode, bench_relay_fanout);
criterion_main!(benches);
