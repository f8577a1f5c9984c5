use std::hint::black_box;

use bubbles_engine::broadcast::{BroadcastGroup, RoomEvent, RoomManager};
use bubbles_engine::compression::Compression;
use bubbles_engine::mapper::{reverse_scale, scale, Frame};
use bubbles_engine::plot::{PlotSnapshot, Plotter};
use bubbles_engine::protocol::{PositionReport, WireMessage};
use bubbles_engine::roster::{color_from_id, PositionRoster};
use criterion::{criterion_group, criterion_main, Criterion};
use uuid::Uuid;

fn bench_position_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let report = PositionReport { x: -250, y: 480, color: 0x3366ff };

    for codec in [Compression::None, Compression::Lz4] {
        c.bench_function(&format!("position_encode_{codec:?}"), |b| {
            b.iter(|| {
                let msg = WireMessage::position(black_box(peer), black_box(7), &report, codec).unwrap();
                black_box(msg.encode().unwrap());
            })
        });
    }
}

fn bench_position_decode(c: &mut Criterion) {
    let report = PositionReport { x: -250, y: 480, color: 0x3366ff };
    let encoded = WireMessage::position(Uuid::new_v4(), 7, &report, Compression::Lz4)
        .unwrap()
        .encode()
        .unwrap();

    c.bench_function("position_decode_lz4", |b| {
        b.iter(|| {
            let msg = WireMessage::decode(black_box(&encoded)).unwrap();
            black_box(msg.position_report(Compression::Lz4).unwrap());
        })
    });
}

fn bench_roster_snapshot_1000(c: &mut Criterion) {
    let roster = PositionRoster::new();
    for i in 0..1000 {
        let id = Uuid::new_v4();
        roster.upsert(id, i, -i, color_from_id(id));
    }

    c.bench_function("roster_snapshot_1000_peers", |b| {
        b.iter(|| black_box(roster.snapshot()))
    });
}

fn bench_plot_cycle_1000(c: &mut Criterion) {
    let roster = PositionRoster::new();
    for i in 0..1000 {
        roster.upsert(Uuid::new_v4(), i, i, 0x00ff00);
    }
    let frame = Frame::new(1920, 1080);

    c.bench_function("plot_cycle_1000_peers", |b| {
        let mut plotter = Plotter::new();
        b.iter(|| {
            plotter
                .start(PlotSnapshot::new(roster.snapshot(), 0xff0000))
                .unwrap();
            let mut sum = 0i64;
            while !plotter.end().unwrap() {
                let (px, py) = frame.to_pixels(plotter.x().unwrap(), plotter.y().unwrap());
                sum += i64::from(px) + i64::from(py);
                plotter.next().unwrap();
            }
            plotter.done().unwrap();
            black_box(sum)
        })
    });
}

fn bench_mapper(c: &mut Criterion) {
    c.bench_function("scale_reverse_scale", |b| {
        b.iter(|| {
            let px = scale(black_box(437), black_box(1080));
            black_box(reverse_scale(px, 1080))
        })
    });
}

fn bench_broadcast_1000_msgs(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_msgs_64_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);
                let mut receivers: Vec<_> = (0..64).map(|_| group.subscribe()).collect();
                let peer = Uuid::new_v4();
                for seq in 0..1000 {
                    group.broadcast(RoomEvent::Position {
                        peer_id: peer,
                        seq,
                        report: PositionReport { x: 1, y: 2, color: 3 },
                    });
                }
                for rx in &mut receivers {
                    while rx.try_recv().is_ok() {}
                }
            })
        })
    });
}

fn bench_room_join_leave(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("room_join_leave_32_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let rooms = RoomManager::new(64, 64);
                let peers: Vec<Uuid> = (0..32).map(|_| Uuid::new_v4()).collect();
                for (conn, peer) in peers.iter().enumerate() {
                    black_box(rooms.join("bench", *peer, conn as u64, 0).await.unwrap().color);
                }
                for (conn, peer) in peers.iter().enumerate() {
                    rooms.leave("bench", *peer, conn as u64).await;
                }
            })
        })
    });
}

criterion_group!(
    benches,
    bench_position_encode,
    bench_position_decode,
    bench_roster_snapshot_1000,
    bench_plot_cycle_1000,
    bench_mapper,
    bench_broadcast_1000_msgs,
    bench_room_join_leave,
);
criterion_main!(benches);
