//! Desktop notification source.
//!
//! Notifications are observed by monitoring `Notify` calls to the session
//! notification daemon, so nothing has to be registered with it. Monitoring
//! turns the connection into a receive-only one, which is why the monitor
//! owns a dedicated session bus connection.

use std::{
   collections::HashMap,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
};

use futures::StreamExt;
use log::{debug, info};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use zbus::{
   Connection, MatchRule, Message, MessageStream, fdo::MonitoringProxy, message::Type,
   zvariant::OwnedValue,
};

use crate::{bluetooth::manager::PayloadSender, config::Config, error::Result, payload};

const NOTIFICATIONS_INTERFACE: &str = "org.freedesktop.Notifications";
const NOTIFY_MEMBER: &str = "Notify";

/// Arguments of `org.freedesktop.Notifications.Notify`.
type NotifyArgs = (
   String,
   u32,
   String,
   String,
   String,
   Vec<String>,
   HashMap<String, OwnedValue>,
   i32,
);

/// A desktop notification as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
   pub app: String,
   pub title: String,
   pub body: String,
}

impl Notification {
   /// Extracts a notification from a monitored `Notify` call.
   pub fn from_message(msg: &Message) -> Option<Self> {
      let header = msg.header();
      if msg.message_type() != Type::MethodCall
         || header.interface().map(|i| i.as_str()) != Some(NOTIFICATIONS_INTERFACE)
         || header.member().map(|m| m.as_str()) != Some(NOTIFY_MEMBER)
      {
         return None;
      }

      let (app, _replaces_id, _icon, title, body, _actions, _hints, _timeout): NotifyArgs =
         match msg.body().deserialize() {
            Ok(args) => args,
            Err(e) => {
               debug!("Malformed Notify call: {e}");
               return None;
            },
         };
      Some(Self { app, title, body })
   }
}

/// Forwards notifications to the peripheral while the relay service is active.
pub struct NotificationRelay {
   sender: PayloadSender,
   active: Arc<AtomicBool>,
   config: Arc<Mutex<Config>>,
}

impl NotificationRelay {
   pub const fn new(
      sender: PayloadSender,
      active: Arc<AtomicBool>,
      config: Arc<Mutex<Config>>,
   ) -> Self {
      Self {
         sender,
         active,
         config,
      }
   }

   /// Returns `true` if the notification was queued for sending.
   pub fn relay(&self, notification: &Notification) -> bool {
      if !self.active.load(Ordering::Acquire) {
         return false;
      }
      {
         let config = self.config.lock();
         if !config.forward_notifications || config.is_app_ignored(&notification.app) {
            debug!("Skipping notification from {}", notification.app);
            return false;
         }
      }

      let text = payload::format_notification(
         &notification.app,
         &notification.title,
         &notification.body,
      );
      self.sender.send_text(&text)
   }
}

/// Starts monitoring the session bus for notifications.
pub async fn spawn_monitor(relay: NotificationRelay) -> Result<JoinHandle<()>> {
   let connection = Connection::session().await?;
   let monitoring = MonitoringProxy::new(&connection).await?;

   let rule = MatchRule::builder()
      .msg_type(Type::MethodCall)
      .interface(NOTIFICATIONS_INTERFACE)?
      .member(NOTIFY_MEMBER)?
      .build();
   monitoring.become_monitor(&[rule], 0).await?;
   info!("Monitoring desktop notifications");

   let mut stream = MessageStream::from(&connection);
   Ok(tokio::spawn(async move {
      while let Some(msg) = stream.next().await {
         let Ok(msg) = msg else {
            continue;
         };
         if let Some(notification) = Notification::from_message(&msg) {
            debug!("Notification from {}", notification.app);
            relay.relay(&notification);
         }
      }
      info!("Notification monitor stopped");
   }))
}
