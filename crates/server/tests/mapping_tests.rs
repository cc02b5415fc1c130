//! Mapping engine integration tests
//!
//! Compile real JSON configurations and route messages into real
//! drivers (backed by a test channel bridge, no hardware).

use common::{create_usb_bridge, DeviceInfo, DeviceKey, UsbBridge, UsbWorker};
use protocol::OpcMessage;
use server::config::Config;
use server::devices::Device;
use server::mapping::{apply_message, Mapping};

fn compile(json: &str) -> Mapping {
    let config: Config = serde_json::from_str(json).unwrap();
    config.validate().unwrap();
    Mapping::compile(&config)
}

fn bridge() -> (UsbBridge, UsbWorker) {
    create_usb_bridge()
}

fn fadecandy(serial: &str, bridge: &UsbBridge) -> Device {
    let info = DeviceInfo {
        key: DeviceKey { bus: 1, address: 5 },
        vendor_id: 0x1d50,
        product_id: 0x607a,
        serial: Some(serial.to_string()),
    };
    Device::attach(&info, bridge.out_port()).expect("fadecandy driver")
}

fn enttec(serial: &str, bridge: &UsbBridge) -> Device {
    let info = DeviceInfo {
        key: DeviceKey { bus: 1, address: 6 },
        vendor_id: 0x0403,
        product_id: 0x6001,
        serial: Some(serial.to_string()),
    };
    Device::attach(&info, bridge.out_port()).expect("enttec driver")
}

fn fc_pixel(device: &Device, index: usize) -> [u16; 3] {
    let Device::Fadecandy(fc) = device else {
        panic!("not a fadecandy");
    };
    fc.framebuffer_pixel(index).unwrap()
}

#[test]
fn serial_binding_wins_over_wildcard_by_order() {
    let mapping = compile(
        r#"{ "devices": [
            { "type": "fadecandy", "serial": "FC000002", "map": [[1, 0, 0, 8]] },
            { "type": "fadecandy", "map": [[2, 0, 0, 8]] }
        ]}"#,
    );

    let (bridge, _worker) = bridge();
    let exact = fadecandy("FC000002", &bridge);
    let other = fadecandy("FC999999", &bridge);

    assert_eq!(mapping.bind(&exact), Some(0));
    assert_eq!(mapping.bind(&other), Some(1));
}

#[test]
fn kind_mismatch_never_binds() {
    let mapping = compile(r#"{ "devices": [ { "type": "enttec", "map": [] } ] }"#);
    let (bridge, _worker) = bridge();
    let fc = fadecandy("FC000001", &bridge);
    assert_eq!(mapping.bind(&fc), None);
}

#[test]
fn range_routing_with_offsets() {
    let mapping = compile(
        r#"{ "devices": [
            { "type": "fadecandy", "map": [[1, 2, 10, 3]] }
        ]}"#,
    );
    let (bridge, _worker) = bridge();
    let mut device = fadecandy("FC000001", &bridge);

    let message = OpcMessage::set_pixels(
        1,
        &[[0, 0, 0], [1, 1, 1], [2, 2, 2], [3, 3, 3], [4, 4, 4], [5, 5, 5]],
    );
    assert!(apply_message(mapping.binding(0), &message, &mut device));

    // Source pixels 2..5 land on device pixels 10..13.
    assert_eq!(fc_pixel(&device, 10), [0x0202, 0x0202, 0x0202]);
    assert_eq!(fc_pixel(&device, 12), [0x0404, 0x0404, 0x0404]);
    // Neighbours untouched.
    assert_eq!(fc_pixel(&device, 9), [0, 0, 0]);
    assert_eq!(fc_pixel(&device, 13), [0, 0, 0]);
}

#[test]
fn later_entries_win_on_overlap() {
    let mapping = compile(
        r#"{ "devices": [
            { "type": "fadecandy", "map": [
                [1, 0, 0, 4],
                [1, 4, 0, 1]
            ] }
        ]}"#,
    );
    let (bridge, _worker) = bridge();
    let mut device = fadecandy("FC000001", &bridge);

    let message = OpcMessage::set_pixels(
        1,
        &[[1, 1, 1], [2, 2, 2], [3, 3, 3], [4, 4, 4], [99, 99, 99]],
    );
    apply_message(mapping.binding(0), &message, &mut device);

    // The second entry re-targets device pixel 0 from source pixel 4.
    assert_eq!(fc_pixel(&device, 0), [0x6363, 0x6363, 0x6363]);
    assert_eq!(fc_pixel(&device, 1), [0x0202, 0x0202, 0x0202]);
}

#[test]
fn per_entry_scale_applies() {
    let mapping = compile(
        r#"{ "devices": [
            { "type": "fadecandy", "map": [[1, 0, 0, 1, [0.5, 1.0, 0.0]]] }
        ]}"#,
    );
    let (bridge, _worker) = bridge();
    let mut device = fadecandy("FC000001", &bridge);

    apply_message(
        mapping.binding(0),
        &OpcMessage::set_pixels(1, &[[200, 100, 50]]),
        &mut device,
    );
    assert_eq!(fc_pixel(&device, 0), [0x6464, 0x6464, 0x0000]);
}

#[test]
fn constant_color_paints_on_any_payload() {
    let mapping = compile(
        r##"{ "devices": [
            { "type": "fadecandy", "map": [[1, 8, 2, "#ff8000"]] }
        ]}"##,
    );
    let (bridge, _worker) = bridge();
    let mut device = fadecandy("FC000001", &bridge);

    apply_message(
        mapping.binding(0),
        &OpcMessage::set_pixels(1, &[[0, 0, 0]]),
        &mut device,
    );
    assert_eq!(fc_pixel(&device, 8), [0xFFFF, 0x8080, 0x0000]);
    assert_eq!(fc_pixel(&device, 9), [0xFFFF, 0x8080, 0x0000]);
    assert_eq!(fc_pixel(&device, 10), [0, 0, 0]);
}

#[test]
fn source_pixels_past_payload_stop_silently() {
    let mapping = compile(
        r#"{ "devices": [
            { "type": "fadecandy", "map": [[1, 0, 0, 64]] }
        ]}"#,
    );
    let (bridge, _worker) = bridge();
    let mut device = fadecandy("FC000001", &bridge);

    // Two pixels of payload under a 64-pixel entry.
    apply_message(
        mapping.binding(0),
        &OpcMessage::set_pixels(1, &[[9, 9, 9], [8, 8, 8]]),
        &mut device,
    );
    assert_eq!(fc_pixel(&device, 1), [0x0808, 0x0808, 0x0808]);
    assert_eq!(fc_pixel(&device, 2), [0, 0, 0]);
}

#[test]
fn empty_payload_writes_nothing() {
    let mapping = compile(
        r#"{ "devices": [
            { "type": "fadecandy", "map": [[1, 0, 0, 64]] }
        ]}"#,
    );
    let (bridge, _worker) = bridge();
    let mut device = fadecandy("FC000001", &bridge);

    let touched = apply_message(
        mapping.binding(0),
        &OpcMessage::set_pixels(1, &[]),
        &mut device,
    );
    assert!(!touched);
}

#[test]
fn dmx_component_routing() {
    let mapping = compile(
        r#"{ "devices": [
            { "type": "enttec", "serial": "EN000001", "map": [
                [1, 0, "r", 0],
                [1, 0, "g", 1],
                [1, 0, "b", 2],
                [1, 1, "r", 7]
            ] }
        ]}"#,
    );
    let (bridge, _worker) = bridge();
    let mut device = enttec("EN000001", &bridge);

    let touched = apply_message(
        mapping.binding(0),
        &OpcMessage::set_pixels(1, &[[10, 20, 30], [40, 41, 42]]),
        &mut device,
    );
    assert!(touched);

    let Device::Enttec(dmx) = &device else {
        panic!("expected enttec")
    };
    assert_eq!(dmx.channel_value(0), Some(10));
    assert_eq!(dmx.channel_value(1), Some(20));
    assert_eq!(dmx.channel_value(2), Some(30));
    assert_eq!(dmx.channel_value(7), Some(40));
    assert_eq!(dmx.channel_value(3), Some(0));
}

#[test]
fn effective_color_precedence() {
    let json = r#"{
        "color": { "gamma": 2.2, "whitepoint": [1.0, 1.0, 1.0] },
        "devices": [
            { "type": "fadecandy", "serial": "FC000001",
              "color": { "gamma": 1.6, "whitepoint": [0.9, 0.9, 0.9] }, "map": [] },
            { "type": "fadecandy", "map": [] }
        ]
    }"#;
    let config: Config = serde_json::from_str(json).unwrap();
    let mapping = Mapping::compile(&config);

    // Device override replaces the global section entirely.
    let overridden = mapping.effective_color(Some(0), config.color.as_ref());
    assert_eq!(overridden.gamma, 1.6);
    assert_eq!(overridden.whitepoint, [0.9, 0.9, 0.9]);

    // No override: the global section applies.
    let global = mapping.effective_color(Some(1), config.color.as_ref());
    assert_eq!(global.gamma, 2.2);

    // Neither: identity.
    let identity = mapping.effective_color(None, None);
    assert!(identity.is_identity());
}
