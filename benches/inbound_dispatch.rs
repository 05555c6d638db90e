use bytes::Bytes;
use chrono::{TimeZone, Utc};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

use driver_link::connection::{InboundMessage, OutboundMessage, decode_inbound};
use driver_link::credentials::DriverStatus;
use driver_link::location::{JobReference, LocationSample, LocationUpdate, PositionFix};

const FRAMES: usize = 1_000;

fn order_assigned_frame() -> Bytes {
    // Roughly the size of a real assignment: pickup, dropoff and a few line items.
    Bytes::from_static(
        br#"{"type":"order_assigned","data":{"order_id":48213,"restaurant":{"id":91,"name":"Luigi's","lat":52.5208,"lng":13.4094},"customer":{"name":"A. Example","lat":52.5301,"lng":13.3849,"address":"Invalidenstr. 117"},"items":[{"name":"Margherita","qty":2},{"name":"Tiramisu","qty":1}],"total":"31.40","notes":"ring twice"}}"#,
    )
}

fn pong_frame() -> Bytes {
    Bytes::from_static(br#"{"type":"pong"}"#)
}

fn bench_decode_inbound(c: &mut Criterion) {
    let order = order_assigned_frame();
    let pong = pong_frame();

    c.bench_function(&format!("decode_order_assigned_x{FRAMES}"), |b| {
        b.iter(|| {
            let mut orders = 0usize;
            for _ in 0..FRAMES {
                let msg = decode_inbound(black_box(order.as_ref())).unwrap();
                if matches!(msg, InboundMessage::OrderAssigned(_)) {
                    orders += 1;
                }
            }
            black_box(orders);
        })
    });

    c.bench_function(&format!("decode_pong_x{FRAMES}"), |b| {
        b.iter(|| {
            let mut pongs = 0usize;
            for _ in 0..FRAMES {
                if matches!(
                    decode_inbound(black_box(pong.as_ref())),
                    Ok(InboundMessage::Pong)
                ) {
                    pongs += 1;
                }
            }
            black_box(pongs);
        })
    });

    c.bench_function("order_assigned_into_event", |b| {
        b.iter(|| {
            let msg = decode_inbound(black_box(order.as_ref())).unwrap();
            black_box(msg.into_event());
        })
    });
}

fn bench_encode_location(c: &mut Criterion) {
    let captured_at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
    let fix = PositionFix {
        latitude: 52.520008,
        longitude: 13.404954,
        accuracy: Some(6.5),
        heading: Some(184.0),
        speed: Some(7.2),
        captured_at,
    };
    let update = LocationUpdate {
        sample: LocationSample::from_fix(&fix, Some(77)),
        status: DriverStatus::Online,
        job: Some(JobReference::Numeric(48213)),
    };

    c.bench_function("encode_location_update", |b| {
        b.iter(|| {
            let text = OutboundMessage::LocationUpdate(black_box(&update).payload())
                .encode()
                .unwrap();
            black_box(text);
        })
    });
}

criterion_group!(benches, bench_decode_inbound, bench_encode_location);
criterion_main!(benches);
