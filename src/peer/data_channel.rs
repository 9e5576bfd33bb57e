use crate::peer::connection::DataChannelSlot;
use crate::peer::transport::{TransportEvent, TransportEvents};
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::data_channel::RTCDataChannel;

/// общий обработчик data-channel: события уходят в очередь контроллера
pub fn attach_dc(dc: &Arc<RTCDataChannel>, slot: &DataChannelSlot, events: &TransportEvents) {
    debug!(label = dc.label(), "attach_dc called");
    *slot.lock() = Some(dc.clone());

    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        info!("Data channel opened");
        let _ = open_events.send(TransportEvent::DataChannelOpen);
        Box::pin(async {})
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg| {
        debug!(len = msg.data.len(), "Received message");
        let text = String::from_utf8_lossy(&msg.data).to_string();
        let _ = message_events.send(TransportEvent::DataMessage(text));
        Box::pin(async {})
    }));

    let close_events = events.clone();
    let close_slot = slot.clone();
    dc.on_close(Box::new(move || {
        info!("Data channel closed");
        close_slot.lock().take();
        let _ = close_events.send(TransportEvent::DataChannelClosed);
        Box::pin(async {})
    }));
}
