//! RTMP server session
//!
//! One task per accepted connection. After the handshake the session reads
//! commands until `publish` or `play` decides its role:
//!
//! - publishers feed audio, video and `onMetaData` into a [`HubPublisher`]
//! - players drain a [`Subscription`] and re-frame every [`HubFrame`] as
//!   RTMP audio/video/data messages

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use super::state::{SessionPhase, SessionState};
use crate::amf::{self, AmfValue};
use crate::error::{Error, MediaError, ProtocolError, Result};
use crate::hub::{
    HubFrame, HubManager, HubPublisher, PublisherKind, PublisherObserver, StreamIdentity,
    SubscriberProtocol, Subscription,
};
use crate::media::flv::{self, FlvMedia};
use crate::protocol::constants::*;
use crate::protocol::{server_handshake, Command, InboundMessage, RtmpConnection, RtmpMessage, UserControlEvent};
use crate::stats::{CountingStream, SessionStat, StatDirection, StatSession};

/// Connection parameters a server session negotiates
#[derive(Debug, Clone)]
pub struct RtmpSessionOptions {
    /// Zero disables the deadline
    pub handshake_timeout: Duration,
    pub chunk_size: u32,
    pub window_ack_size: u32,
    pub peer_bandwidth: u32,
}

impl Default for RtmpSessionOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            chunk_size: RECOMMENDED_CHUNK_SIZE,
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            peer_bandwidth: DEFAULT_PEER_BANDWIDTH,
        }
    }
}

enum Next {
    Continue,
    Play(Subscription),
    Stop,
}

pub struct RtmpServerSession<S> {
    id: u64,
    conn: RtmpConnection<CountingStream<S>>,
    state: SessionState,
    hubs: Arc<HubManager>,
    options: RtmpSessionOptions,
    stat: SessionStat,
    publisher: Option<HubPublisher>,
}

impl<S> RtmpServerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        id: u64,
        stream: S,
        remote_addr: Option<SocketAddr>,
        hubs: Arc<HubManager>,
        options: RtmpSessionOptions,
    ) -> Self {
        let stat = SessionStat::new("RTMP", format!("RTMPPUBSUB{}", id), remote_addr, StatDirection::Read);
        let conn = RtmpConnection::new(CountingStream::new(stream, stat.conn()));
        Self {
            id,
            conn,
            state: SessionState::new(),
            hubs,
            options,
            stat,
            publisher: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase()
    }

    pub fn stat(&self) -> StatSession {
        self.stat.snapshot()
    }

    pub fn update_stat(&mut self, interval_secs: u32) {
        self.stat.update_stat(interval_secs);
    }

    pub fn is_alive(&mut self) -> bool {
        self.stat.is_alive()
    }

    /// Serve the connection until the peer leaves or an error ends it
    pub async fn run(&mut self) -> Result<()> {
        let result = self.serve().await;
        self.dispose();
        result
    }

    /// Detach from the hub and mark the session closed; safe to repeat
    pub fn dispose(&mut self) {
        if let Some(publisher) = self.publisher.take() {
            tracing::info!(
                session_id = self.id,
                stream = %publisher.hub().identity(),
                "Publish stopped"
            );
        }
        self.state.close();
    }

    async fn serve(&mut self) -> Result<()> {
        server_handshake(self.conn.get_mut(), self.options.handshake_timeout).await?;
        self.state.complete_handshake();
        tracing::debug!(session_id = self.id, "Handshake complete");

        loop {
            let InboundMessage { header, message } = self.conn.read_message().await?;
            match message {
                RtmpMessage::Command(cmd) => match self.on_command(cmd).await? {
                    Next::Continue => {}
                    Next::Play(sub) => return self.play(sub).await,
                    Next::Stop => return Ok(()),
                },
                RtmpMessage::Data(values) => self.on_data(values)?,
                RtmpMessage::Audio(data) => {
                    let media = flv::parse_audio(header.timestamp, data);
                    self.on_media(media)?;
                }
                RtmpMessage::Video(data) => {
                    let media = flv::parse_video(header.timestamp, data);
                    self.on_media(media)?;
                }
                other => tracing::trace!(session_id = self.id, ?other, "Ignoring message"),
            }
        }
    }

    async fn on_command(&mut self, cmd: Command) -> Result<Next> {
        tracing::debug!(session_id = self.id, command = %cmd.name, "Command");
        match cmd.name.as_str() {
            CMD_CONNECT => self.on_connect(&cmd).await?,
            CMD_CREATE_STREAM => {
                let stream_id = self.state.on_create_stream()?;
                let reply = Command::result(cmd.transaction_id, AmfValue::Null, vec![AmfValue::from(stream_id)]);
                self.send_command(reply, 0).await?;
            }
            CMD_RELEASE_STREAM | CMD_FC_PUBLISH => {
                if cmd.transaction_id > 0.0 {
                    let reply = Command::result(cmd.transaction_id, AmfValue::Null, vec![AmfValue::Undefined]);
                    self.send_command(reply, 0).await?;
                }
            }
            CMD_FC_UNPUBLISH | CMD_GET_STREAM_LENGTH => {}
            CMD_PUBLISH => self.on_publish(&cmd).await?,
            CMD_PLAY => return Ok(Next::Play(self.on_play(&cmd).await?)),
            CMD_DELETE_STREAM | CMD_CLOSE_STREAM => {
                self.state.close();
                return Ok(Next::Stop);
            }
            other => tracing::debug!(session_id = self.id, command = other, "Unhandled command"),
        }
        Ok(Next::Continue)
    }

    async fn on_connect(&mut self, cmd: &Command) -> Result<()> {
        let app = cmd.object.get_string("app").unwrap_or_default();
        let tc_url = cmd.object.get_string("tcUrl");
        self.state.on_connect(app, tc_url)?;

        self.conn
            .send(&RtmpMessage::WindowAckSize(self.options.window_ack_size), 0, 0)
            .await?;
        self.conn
            .send(
                &RtmpMessage::SetPeerBandwidth {
                    size: self.options.peer_bandwidth,
                    limit_type: BANDWIDTH_LIMIT_DYNAMIC,
                },
                0,
                0,
            )
            .await?;
        self.conn.set_out_chunk_size(self.options.chunk_size).await?;

        let properties = crate::amf_object! {
            "fmsVer" => "FMS/3,0,1,123",
            "capabilities" => 31.0,
        };
        let info = crate::amf_object! {
            "level" => "status",
            "code" => NC_CONNECT_SUCCESS,
            "description" => "Connection succeeded.",
            "objectEncoding" => 0.0,
        };
        self.send_command(Command::result(cmd.transaction_id, properties, vec![info]), 0)
            .await?;
        tracing::info!(session_id = self.id, app = %self.state.app(), "Connected");
        Ok(())
    }

    async fn on_publish(&mut self, cmd: &Command) -> Result<()> {
        let stream_id = self.state.on_publish()?;
        let name = stream_name(cmd.string_arg(0), "publish")?;
        let identity = StreamIdentity::new(self.state.app(), name);

        match self.hubs.publish(&identity, self.id, PublisherKind::Local).await {
            Ok(publisher) => {
                self.stat.set_direction(StatDirection::Read);
                self.publisher = Some(publisher);
                let status = Command::on_status("status", NS_PUBLISH_START, "Start publishing");
                self.send_command(status, stream_id).await?;
                tracing::info!(session_id = self.id, stream = %identity, "Publish started");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(session_id = self.id, stream = %identity, error = %e, "Publish rejected");
                let status = Command::on_status("error", NS_PUBLISH_BAD_NAME, "Stream already publishing");
                self.send_command(status, stream_id).await?;
                Err(e.into())
            }
        }
    }

    async fn on_play(&mut self, cmd: &Command) -> Result<Subscription> {
        let stream_id = self.state.on_play()?;
        let name = stream_name(cmd.string_arg(0), "play")?;
        let identity = StreamIdentity::new(self.state.app(), name);

        let sub = self.hubs.subscribe(&identity, SubscriberProtocol::Rtmp).await?;
        self.stat.set_direction(StatDirection::Write);

        self.conn
            .send(&RtmpMessage::UserControl(UserControlEvent::StreamBegin(stream_id)), 0, 0)
            .await?;
        self.send_command(Command::on_status("status", NS_PLAY_RESET, "Playing and resetting"), stream_id)
            .await?;
        self.send_command(Command::on_status("status", NS_PLAY_START, "Started playing"), stream_id)
            .await?;
        tracing::info!(session_id = self.id, stream = %identity, subscriber_id = sub.id(), "Play started");
        Ok(sub)
    }

    fn on_data(&mut self, mut values: Vec<AmfValue>) -> Result<()> {
        if values.first().and_then(AmfValue::as_str) == Some(CMD_SET_DATA_FRAME) {
            values.remove(0);
        }
        if values.first().and_then(AmfValue::as_str) != Some(CMD_ON_METADATA) {
            tracing::trace!(session_id = self.id, "Ignoring data message");
            return Ok(());
        }
        match self.publisher.as_mut() {
            Some(publisher) => publisher.on_metadata(amf::encode_all(&values)),
            None => Ok(()),
        }
    }

    fn on_media(&mut self, media: Result<FlvMedia>) -> Result<()> {
        let Some(publisher) = self.publisher.as_mut() else {
            return Ok(());
        };
        match media {
            Ok(FlvMedia::Config(config)) => publisher.on_av_config(&config),
            Ok(FlvMedia::Packet(pkt)) => publisher.on_av_packet(pkt),
            Ok(FlvMedia::Ignored) => Ok(()),
            Err(Error::Media(e @ (MediaError::UnsupportedAudio(_) | MediaError::UnsupportedVideo(_)))) => {
                tracing::trace!(session_id = self.id, error = %e, "Dropping media");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn play(&mut self, mut sub: Subscription) -> Result<()> {
        let stream_id = self.state.stream_id().unwrap_or(1);
        loop {
            tokio::select! {
                frame = sub.recv() => {
                    let mut frame = frame?;
                    loop {
                        if frame.is_closed() {
                            self.conn
                                .send(&RtmpMessage::UserControl(UserControlEvent::StreamEof(stream_id)), 0, 0)
                                .await?;
                            self.conn.flush().await?;
                            return Ok(());
                        }
                        for (message, timestamp) in frame_messages(&frame)? {
                            self.conn.send(&message, timestamp, stream_id).await?;
                        }
                        match sub.try_recv() {
                            Some(next) => frame = next,
                            None => break,
                        }
                    }
                    self.conn.flush().await?;
                }
                msg = self.conn.next_message() => {
                    self.conn.write_control().await?;
                    let Some(msg) = msg? else {
                        continue;
                    };
                    match msg.message {
                        RtmpMessage::Command(cmd) => match cmd.name.as_str() {
                            CMD_DELETE_STREAM | CMD_CLOSE_STREAM => return Ok(()),
                            CMD_PLAY | CMD_PUBLISH | CMD_CONNECT | CMD_CREATE_STREAM => {
                                return Err(ProtocolError::UnexpectedCommand {
                                    command: cmd.name,
                                    phase: self.state.phase().to_string(),
                                }
                                .into());
                            }
                            _ => {}
                        },
                        other => tracing::trace!(session_id = self.id, ?other, "Ignoring message from player"),
                    }
                }
            }
        }
    }

    async fn send_command(&mut self, cmd: Command, stream_id: u32) -> Result<()> {
        self.conn.send(&RtmpMessage::Command(cmd), 0, stream_id).await?;
        self.conn.flush().await
    }
}

/// `name?query` -> `name`
fn stream_name(arg: Option<&str>, command: &'static str) -> Result<String> {
    let name = arg.and_then(|s| s.split('?').next()).unwrap_or_default().trim();
    if name.is_empty() {
        return Err(ProtocolError::MalformedMessage(command).into());
    }
    Ok(name.to_string())
}

/// RTMP messages, with their timestamps, that carry one hub frame
pub(crate) fn frame_messages(frame: &HubFrame) -> Result<Vec<(RtmpMessage, u32)>> {
    let messages = match frame {
        HubFrame::Metadata(data) => vec![(RtmpMessage::Data(amf::decode_all(data)?), 0)],
        HubFrame::Config(config) => {
            let mut messages = Vec::with_capacity(2);
            if let Some(asc) = &config.asc {
                messages.push((RtmpMessage::Audio(flv::audio_config_body(asc)), 0));
            }
            if config.video_codec().is_some() {
                messages.push((RtmpMessage::Video(flv::video_config_body(config)?), 0));
            }
            messages
        }
        HubFrame::Packet(pkt) => {
            let body = flv::packet_body(pkt);
            let message = if pkt.is_video() {
                RtmpMessage::Video(body)
            } else {
                RtmpMessage::Audio(body)
            };
            vec![(message, pkt.timestamp)]
        }
        HubFrame::Closed => Vec::new(),
    };
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::io::DuplexStream;

    use super::*;
    use crate::error::HubError;
    use crate::hub::HubConfig;
    use crate::media::nal::to_avcc;
    use crate::media::{AvPacket, CodecConfig, PayloadType};
    use crate::protocol::client_handshake;

    fn avc_config() -> CodecConfig {
        CodecConfig {
            sps: Some(Bytes::from_static(&[0x67, 0x42, 0xC0, 0x1E, 0x95])),
            pps: Some(Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80])),
            ..Default::default()
        }
    }

    fn spawn_session(
        hubs: &Arc<HubManager>,
        id: u64,
    ) -> (DuplexStream, tokio::task::JoinHandle<Result<()>>) {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let mut session = RtmpServerSession::new(id, server, None, Arc::clone(hubs), RtmpSessionOptions::default());
        let handle = tokio::spawn(async move { session.run().await });
        (client, handle)
    }

    async fn next_command(conn: &mut RtmpConnection<DuplexStream>) -> Command {
        loop {
            if let RtmpMessage::Command(cmd) = conn.read_message().await.unwrap().message {
                return cmd;
            }
        }
    }

    async fn call(conn: &mut RtmpConnection<DuplexStream>, cmd: Command, stream_id: u32) {
        conn.send(&RtmpMessage::Command(cmd), 0, stream_id).await.unwrap();
        conn.flush().await.unwrap();
    }

    /// Handshake, connect and createStream; returns the message stream id
    async fn setup(mut io: DuplexStream) -> (RtmpConnection<DuplexStream>, u32) {
        client_handshake(&mut io, Duration::from_secs(5)).await.unwrap();
        let mut conn = RtmpConnection::new(io);

        let connect = Command::new(CMD_CONNECT, 1.0, crate::amf_object! { "app" => "live" }, vec![]);
        call(&mut conn, connect, 0).await;
        let reply = next_command(&mut conn).await;
        assert_eq!(reply.name, CMD_RESULT);
        assert_eq!(reply.args[0].get_string("code"), Some(NC_CONNECT_SUCCESS));
        assert_eq!(conn.in_chunk_size(), RECOMMENDED_CHUNK_SIZE);

        call(&mut conn, Command::new(CMD_CREATE_STREAM, 2.0, AmfValue::Null, vec![]), 0).await;
        let reply = next_command(&mut conn).await;
        let stream_id = reply.number_arg(0).unwrap() as u32;
        (conn, stream_id)
    }

    async fn publish(conn: &mut RtmpConnection<DuplexStream>, stream_id: u32, name: &str) -> Command {
        let cmd = Command::new(CMD_PUBLISH, 3.0, AmfValue::Null, vec![name.into(), "live".into()]);
        call(conn, cmd, stream_id).await;
        next_command(conn).await
    }

    #[tokio::test]
    async fn test_publish_feeds_hub() {
        let hubs = Arc::new(HubManager::new(HubConfig::default()));
        let (io, _handle) = spawn_session(&hubs, 1);
        let (mut conn, stream_id) = setup(io).await;
        assert_eq!(stream_id, 1);

        let status = publish(&mut conn, stream_id, "cam1?token=x").await;
        assert_eq!(status.args[0].get_string("code"), Some(NS_PUBLISH_START));

        let config = avc_config();
        let key = AvPacket::video(PayloadType::Avc, 0, 0, to_avcc([&[0x65u8, 0x88][..]]));
        conn.send(&RtmpMessage::Video(flv::video_config_body(&config).unwrap()), 0, stream_id)
            .await
            .unwrap();
        conn.send(&RtmpMessage::Video(flv::packet_body(&key)), 0, stream_id)
            .await
            .unwrap();
        conn.flush().await.unwrap();

        let identity = StreamIdentity::new("live", "cam1");
        let hub = hubs.get(&identity).await.unwrap();
        // the session processes messages asynchronously
        for _ in 0..100 {
            if hub.stat().gop_count == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(hub.has_publisher());
        assert_eq!(hub.stat().gop_count, 1);
        assert_eq!(*hub.codec_config(), config);
    }

    #[tokio::test]
    async fn test_second_publisher_gets_bad_name() {
        let hubs = Arc::new(HubManager::new(HubConfig::default()));
        let (io1, _h1) = spawn_session(&hubs, 1);
        let (mut first, sid) = setup(io1).await;
        publish(&mut first, sid, "cam1").await;

        let (io2, h2) = spawn_session(&hubs, 2);
        let (mut second, sid) = setup(io2).await;
        let status = publish(&mut second, sid, "cam1").await;
        assert_eq!(status.args[0].get_string("code"), Some(NS_PUBLISH_BAD_NAME));

        let err = h2.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Hub(HubError::Conflict(_))));

        let hub = hubs.get(&StreamIdentity::new("live", "cam1")).await.unwrap();
        assert_eq!(hub.stat().publisher_id, Some(1));
    }

    #[tokio::test]
    async fn test_publish_before_connect_fails() {
        let hubs = Arc::new(HubManager::new(HubConfig::default()));
        let (mut io, handle) = spawn_session(&hubs, 1);
        client_handshake(&mut io, Duration::from_secs(5)).await.unwrap();
        let mut conn = RtmpConnection::new(io);
        let cmd = Command::new(CMD_PUBLISH, 1.0, AmfValue::Null, vec!["cam1".into()]);
        call(&mut conn, cmd, 0).await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::UnexpectedCommand { .. })));
        assert_eq!(hubs.hub_count().await, 0);
    }

    #[tokio::test]
    async fn test_player_receives_catch_up_and_live() {
        let hubs = Arc::new(HubManager::new(HubConfig::default()));
        let identity = StreamIdentity::new("live", "cam1");
        let mut publisher = hubs.publish(&identity, 100, PublisherKind::Local).await.unwrap();
        let config = avc_config();
        publisher.on_av_config(&config).unwrap();
        publisher
            .on_av_packet(AvPacket::video(PayloadType::Avc, 0, 0, to_avcc([&[0x65u8, 0x88][..]])))
            .unwrap();

        let (io, handle) = spawn_session(&hubs, 1);
        let (mut conn, stream_id) = setup(io).await;
        call(&mut conn, Command::new(CMD_PLAY, 3.0, AmfValue::Null, vec!["cam1".into()]), stream_id).await;

        let reset = next_command(&mut conn).await;
        assert_eq!(reset.args[0].get_string("code"), Some(NS_PLAY_RESET));
        let start = next_command(&mut conn).await;
        assert_eq!(start.args[0].get_string("code"), Some(NS_PLAY_START));

        let header = conn.read_message().await.unwrap();
        assert_eq!(header.message, RtmpMessage::Video(flv::video_config_body(&config).unwrap()));
        let key = conn.read_message().await.unwrap();
        assert_eq!(key.header.stream_id, stream_id);
        assert!(matches!(key.message, RtmpMessage::Video(ref b) if b[0] == 0x17 && b[1] == 0x01));

        publisher
            .on_av_packet(AvPacket::video(PayloadType::Avc, 40, 0, to_avcc([&[0x41u8, 0x9A][..]])))
            .unwrap();
        let live = conn.read_message().await.unwrap();
        assert_eq!(live.header.timestamp, 40);
        assert!(matches!(live.message, RtmpMessage::Video(ref b) if b[0] == 0x27));

        call(&mut conn, Command::new(CMD_DELETE_STREAM, 4.0, AmfValue::Null, vec![]), 0).await;
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_stream_name() {
        assert_eq!(stream_name(Some("cam1?k=v"), "play").unwrap(), "cam1");
        assert!(stream_name(Some(""), "play").is_err());
        assert!(stream_name(None, "publish").is_err());
    }

    #[test]
    fn test_frame_messages() {
        let config = CodecConfig {
            asc: Some(Bytes::from_static(&[0x12, 0x10])),
            ..avc_config()
        };
        let messages = frame_messages(&HubFrame::Config(Arc::new(config))).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0].0, RtmpMessage::Audio(_)));
        assert!(matches!(messages[1].0, RtmpMessage::Video(_)));

        let metadata = amf::encode_all(&[AmfValue::from(CMD_ON_METADATA), crate::amf_object! { "width" => 1280.0 }]);
        let messages = frame_messages(&HubFrame::Metadata(metadata)).unwrap();
        assert!(matches!(&messages[0].0, RtmpMessage::Data(v) if v[0].as_str() == Some(CMD_ON_METADATA)));

        assert!(frame_messages(&HubFrame::Closed).unwrap().is_empty());
    }
}
