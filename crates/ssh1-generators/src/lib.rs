use proptest::collection::vec;
use proptest::prelude::*;
use ssh1_proto::*;

pub fn local_channel_id() -> impl Strategy<Value = LocalChannelId> {
    any::<u32>().prop_map(LocalChannelId::from)
}

pub fn remote_channel_id() -> impl Strategy<Value = RemoteChannelId> {
    any::<u32>().prop_map(RemoteChannelId::from)
}

pub fn host() -> impl Strategy<Value = String> {
    "[a-z0-9.-]{1,32}"
}

pub fn originator() -> impl Strategy<Value = Option<String>> {
    proptest::option::of(".{0,64}")
}

pub fn payload() -> impl Strategy<Value = Bytes> {
    vec(any::<u8>(), 0..512).prop_map(Bytes::from)
}

pub fn message_open_confirmation() -> impl Strategy<Value = Message> {
    (remote_channel_id(), local_channel_id())
        .prop_map(|(remote_id, local_id)| Message::open_confirmation(remote_id, local_id))
}

pub fn message_open_failure() -> impl Strategy<Value = Message> {
    remote_channel_id().prop_map(Message::open_failure)
}

pub fn message_data() -> impl Strategy<Value = Message> {
    (remote_channel_id(), payload()).prop_map(|(remote_id, data)| Message::data(remote_id, data))
}

pub fn message_input_eof() -> impl Strategy<Value = Message> {
    remote_channel_id().prop_map(Message::input_eof)
}

pub fn message_output_closed() -> impl Strategy<Value = Message> {
    remote_channel_id().prop_map(Message::output_closed)
}

pub fn message_port_open() -> impl Strategy<Value = Message> {
    (local_channel_id(), host(), any::<u16>(), originator())
        .prop_map(|(local_id, host, port, originator)| Message::port_open(local_id, host, port, originator))
}

pub fn message_x11_open() -> impl Strategy<Value = Message> {
    (local_channel_id(), originator()).prop_map(|(local_id, originator)| Message::x11_open(local_id, originator))
}

pub fn message_port_forward_request() -> impl Strategy<Value = Message> {
    (any::<u16>(), host(), any::<u16>())
        .prop_map(|(server_port, host, port)| Message::port_forward_request(server_port, host, port))
}

pub fn message_session() -> impl Strategy<Value = Message> {
    prop_oneof![
        ".{0,128}".prop_map(Message::disconnect),
        Just(Message::Success),
        Just(Message::Failure),
        payload().prop_map(Message::StdinData),
        payload().prop_map(Message::StdoutData),
        payload().prop_map(Message::StderrData),
        Just(Message::Eof),
        any::<u32>().prop_map(Message::ExitStatus),
        payload().prop_map(Message::Ignore),
        Just(Message::ExitConfirmation),
        ".{0,128}".prop_map(Message::Debug),
    ]
}

pub fn any_channel_message() -> impl Strategy<Value = Message> {
    prop_oneof![
        message_open_confirmation(),
        message_open_failure(),
        message_data(),
        message_input_eof(),
        message_output_closed(),
    ]
}

pub fn any_message() -> impl Strategy<Value = Message> {
    prop_oneof![
        any_channel_message(),
        message_port_open(),
        message_x11_open(),
        message_port_forward_request(),
        message_session(),
    ]
}
