//! RTMP pull session: play a remote stream and hand its media to an observer

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::config::{within, ClientSessionOptions, RtmpUrl};
use super::core::{ClientRole, ClientSession};
use crate::amf::{self, AmfValue};
use crate::error::{Error, MediaError, Result, TimeoutPhase};
use crate::hub::PublisherObserver;
use crate::media::flv::{self, FlvMedia};
use crate::protocol::constants::{CMD_ON_METADATA, CMD_SET_DATA_FRAME};
use crate::protocol::RtmpMessage;
use crate::stats::StatSession;

pub struct PullSession<S> {
    core: ClientSession<S>,
}

impl PullSession<TcpStream> {
    /// Connect and play; returns once the server answered `NetStream.Play.Start`
    pub async fn pull(url: &str, options: ClientSessionOptions) -> Result<Self> {
        let core = ClientSession::connect(ClientRole::Pull, url, options).await?;
        Ok(Self { core })
    }
}

impl<S> PullSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Play over an already connected stream
    pub async fn start(stream: S, url: &str, options: ClientSessionOptions) -> Result<Self> {
        let mut core = ClientSession::new(ClientRole::Pull, stream, None, RtmpUrl::parse(url)?, options);
        core.start().await?;
        Ok(Self { core })
    }

    /// Forward media until the server closes the connection.
    ///
    /// A gap longer than `read_av_timeout` between two messages fails with
    /// `Timeout(ReadAv)`.
    pub async fn run(&mut self, observer: &mut dyn PublisherObserver) -> Result<()> {
        let limit = self.core.options().read_av_timeout;
        loop {
            let msg = match within(limit, TimeoutPhase::ReadAv, self.core.read_message()).await {
                Ok(msg) => msg,
                Err(Error::ConnectionClosed) => {
                    tracing::info!(session_id = self.core.id(), key = %self.unique_key(), "Pull closed by server");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let media = match msg.message {
                RtmpMessage::Audio(data) => flv::parse_audio(msg.header.timestamp, data),
                RtmpMessage::Video(data) => flv::parse_video(msg.header.timestamp, data),
                RtmpMessage::Data(values) => {
                    self.on_data(values, observer)?;
                    continue;
                }
                other => {
                    tracing::trace!(session_id = self.core.id(), ?other, "Ignoring message");
                    continue;
                }
            };
            match media {
                Ok(FlvMedia::Config(config)) => observer.on_av_config(&config)?,
                Ok(FlvMedia::Packet(pkt)) => observer.on_av_packet(pkt)?,
                Ok(FlvMedia::Ignored) => {}
                Err(Error::Media(e @ (MediaError::UnsupportedAudio(_) | MediaError::UnsupportedVideo(_)))) => {
                    tracing::trace!(session_id = self.core.id(), error = %e, "Dropping media");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn on_data(&self, mut values: Vec<AmfValue>, observer: &mut dyn PublisherObserver) -> Result<()> {
        if values.first().and_then(AmfValue::as_str) == Some(CMD_SET_DATA_FRAME) {
            values.remove(0);
        }
        if values.first().and_then(AmfValue::as_str) == Some(CMD_ON_METADATA) {
            observer.on_metadata(amf::encode_all(&values))?;
        }
        Ok(())
    }

    pub async fn dispose(&mut self) {
        self.core.dispose().await;
    }

    pub fn unique_key(&self) -> &str {
        self.core.unique_key()
    }

    pub fn stat(&self) -> StatSession {
        self.core.stat()
    }

    pub fn update_stat(&mut self, interval_secs: u32) {
        self.core.update_stat(interval_secs);
    }

    /// Whether bytes were read since the last call
    pub fn is_alive(&mut self) -> bool {
        self.core.is_alive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::hub::{HubConfig, HubManager, PublisherKind, StreamIdentity};
    use crate::media::nal::to_avcc;
    use crate::media::{AvPacket, CodecConfig, PayloadType};
    use crate::session::{RtmpServerSession, RtmpSessionOptions};

    #[derive(Default)]
    struct Sink {
        metadata: Vec<Bytes>,
        configs: Vec<CodecConfig>,
        packets: Vec<AvPacket>,
    }

    impl PublisherObserver for Sink {
        fn on_av_config(&mut self, config: &CodecConfig) -> Result<()> {
            self.configs.push(config.clone());
            Ok(())
        }

        fn on_av_packet(&mut self, pkt: AvPacket) -> Result<()> {
            self.packets.push(pkt);
            Ok(())
        }

        fn on_metadata(&mut self, metadata: Bytes) -> Result<()> {
            self.metadata.push(metadata);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pull_from_server_session() {
        let hubs = Arc::new(HubManager::new(HubConfig::default()));
        let identity = StreamIdentity::new("live", "origin");
        let mut publisher = hubs.publish(&identity, 500, PublisherKind::Local).await.unwrap();
        let metadata = amf::encode_all(&[AmfValue::from(CMD_ON_METADATA), AmfValue::from("x")]);
        publisher.on_metadata(metadata.clone()).unwrap();
        publisher
            .on_av_config(&CodecConfig {
                sps: Some(Bytes::from_static(&[0x67, 0x42, 0xC0, 0x1E, 0x95])),
                pps: Some(Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80])),
                ..Default::default()
            })
            .unwrap();
        publisher
            .on_av_packet(AvPacket::video(PayloadType::Avc, 0, 0, to_avcc([&[0x65u8, 0x88][..]])))
            .unwrap();

        let (client, server) = tokio::io::duplex(256 * 1024);
        let mut server = RtmpServerSession::new(1, server, None, Arc::clone(&hubs), RtmpSessionOptions::default());
        tokio::spawn(async move { server.run().await });

        let mut pull = PullSession::start(client, "rtmp://127.0.0.1/live/origin", ClientSessionOptions::default())
            .await
            .unwrap();

        let run_hubs = Arc::clone(&hubs);
        let handle = tokio::spawn(async move {
            let mut sink = Sink::default();
            let result = pull.run(&mut sink).await;
            (result, sink)
        });

        // wait until the catch-up has been forwarded, then end the stream
        tokio::time::sleep(Duration::from_millis(50)).await;
        run_hubs.dispose_all().await;

        let (result, sink) = handle.await.unwrap();
        result.unwrap();
        assert_eq!(sink.metadata, vec![metadata]);
        assert_eq!(sink.configs.len(), 1);
        assert!(sink.configs[0].sps.is_some());
        assert_eq!(sink.packets.len(), 1);
        assert!(sink.packets[0].is_keyframe());
    }

    #[tokio::test]
    async fn test_read_av_timeout() {
        let hubs = Arc::new(HubManager::new(HubConfig::default()));
        let identity = StreamIdentity::new("live", "quiet");
        let _publisher = hubs.publish(&identity, 501, PublisherKind::Local).await.unwrap();

        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut server = RtmpServerSession::new(2, server, None, Arc::clone(&hubs), RtmpSessionOptions::default());
        tokio::spawn(async move { server.run().await });

        let options = ClientSessionOptions::default().read_av_timeout(Duration::from_millis(30));
        let mut pull = PullSession::start(client, "rtmp://127.0.0.1/live/quiet", options).await.unwrap();
        let err = pull.run(&mut Sink::default()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(TimeoutPhase::ReadAv)));
        assert!(pull.is_alive());
    }
}
