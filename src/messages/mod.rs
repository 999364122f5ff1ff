use std::fmt;

use serde;

pub use self::types::*;
use crate::ID;

mod types;

macro_rules! next_field {
    ($visitor:expr, $msg:expr) => {
        match $visitor.next_element()? {
            Some(val) => val,
            None => return Err(serde::de::Error::custom($msg)),
        }
    };
}

/// A decoded WAMP session message.
///
/// Every option/details member is carried as a [`Dict`] rather than a
/// fixed-field struct per message type, since the option bag is genuinely
/// free-form on the wire (spec.md §9); handlers read specific members
/// through the [`Options`] accessor trait.
#[derive(Debug, PartialEq)]
pub enum Message {
    Hello(URI, Dict),
    Welcome(ID, Dict),
    Abort(Dict, Reason),
    Goodbye(Dict, Reason),
    Error(ErrorType, ID, Dict, Reason, Option<List>, Option<Dict>),
    Subscribe(ID, Dict, URI),
    Subscribed(ID, ID),
    Unsubscribe(ID, ID),
    Unsubscribed(ID),
    Publish(ID, Dict, URI, Option<List>, Option<Dict>),
    Published(ID, ID),
    Event(ID, ID, Dict, Option<List>, Option<Dict>),
    Register(ID, Dict, URI),
    Registered(ID, ID),
    Unregister(ID, ID),
    Unregistered(ID),
    Call(ID, Dict, URI, Option<List>, Option<Dict>),
    Cancel(ID, Dict),
    Invocation(ID, ID, Dict, Option<List>, Option<Dict>),
    Interrupt(ID, Dict),
    Yield(ID, Dict, Option<List>, Option<Dict>),
    Result(ID, Dict, Option<List>, Option<Dict>),
}

impl Message {
    /// Name used in log lines; matches the WAMP spec's message names.
    pub fn name(&self) -> &'static str {
        match *self {
            Message::Hello(..) => "HELLO",
            Message::Welcome(..) => "WELCOME",
            Message::Abort(..) => "ABORT",
            Message::Goodbye(..) => "GOODBYE",
            Message::Error(..) => "ERROR",
            Message::Subscribe(..) => "SUBSCRIBE",
            Message::Subscribed(..) => "SUBSCRIBED",
            Message::Unsubscribe(..) => "UNSUBSCRIBE",
            Message::Unsubscribed(..) => "UNSUBSCRIBED",
            Message::Publish(..) => "PUBLISH",
            Message::Published(..) => "PUBLISHED",
            Message::Event(..) => "EVENT",
            Message::Register(..) => "REGISTER",
            Message::Registered(..) => "REGISTERED",
            Message::Unregister(..) => "UNREGISTER",
            Message::Unregistered(..) => "UNREGISTERED",
            Message::Call(..) => "CALL",
            Message::Cancel(..) => "CANCEL",
            Message::Invocation(..) => "INVOCATION",
            Message::Interrupt(..) => "INTERRUPT",
            Message::Yield(..) => "YIELD",
            Message::Result(..) => "RESULT",
        }
    }

    /// Reliable control messages get blocking delivery on a saturated peer
    /// queue; everything else (in practice, only EVENT) is drop-oldest, per
    /// spec.md §5.
    pub fn is_reliable(&self) -> bool {
        !matches!(self, Message::Event(..))
    }
}

macro_rules! serialize_with_args {
    ($args:expr, $kwargs:expr, $serializer:expr, $($item: expr),*) => (
        if let Some(ref kwargs) = *$kwargs {
                if let Some(ref args) =  *$args {
                    ( $($item,)* args, kwargs).serialize($serializer)
                } else {
                    ( $($item,)* Vec::<u8>::new(), kwargs).serialize($serializer)
                }
            } else {
                if let Some(ref args) = *$args {
                    ( $($item,)* args).serialize($serializer)
                } else {
                    ( $($item,)*).serialize($serializer)
                }

            }
    );
}

impl serde::Serialize for Message {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match *self {
            Message::Hello(ref realm, ref details) => (1, &realm, details).serialize(serializer),
            Message::Welcome(session, ref details) => (2, session, details).serialize(serializer),
            Message::Abort(ref details, ref reason) => (3, details, reason).serialize(serializer),
            Message::Goodbye(ref details, ref reason) => {
                (6, details, reason).serialize(serializer)
            }
            Message::Error(ref ty, id, ref details, ref reason, ref args, ref kwargs) => {
                serialize_with_args!(args, kwargs, serializer, 8, ty, id, details, reason)
            }
            Message::Subscribe(request_id, ref options, ref topic) => {
                (32, request_id, options, topic).serialize(serializer)
            }
            Message::Subscribed(request_id, subscription_id) => {
                (33, request_id, subscription_id).serialize(serializer)
            }
            Message::Unsubscribe(request_id, subscription_id) => {
                (34, request_id, subscription_id).serialize(serializer)
            }
            Message::Unsubscribed(request_id) => (35, request_id).serialize(serializer),
            Message::Publish(id, ref details, ref topic, ref args, ref kwargs) => {
                serialize_with_args!(args, kwargs, serializer, 16, id, details, topic)
            }
            Message::Published(request_id, publication_id) => {
                (17, request_id, publication_id).serialize(serializer)
            }
            Message::Event(subscription_id, publication_id, ref details, ref args, ref kwargs) => {
                serialize_with_args!(
                    args,
                    kwargs,
                    serializer,
                    36,
                    subscription_id,
                    publication_id,
                    details
                )
            }
            Message::Register(request_id, ref options, ref procedure) => {
                (64, request_id, options, procedure).serialize(serializer)
            }
            Message::Registered(request_id, registration_id) => {
                (65, request_id, registration_id).serialize(serializer)
            }
            Message::Unregister(request_id, registration_id) => {
                (66, request_id, registration_id).serialize(serializer)
            }
            Message::Unregistered(request_id) => (67, request_id).serialize(serializer),
            Message::Call(id, ref options, ref topic, ref args, ref kwargs) => {
                serialize_with_args!(args, kwargs, serializer, 48, id, options, topic)
            }
            Message::Cancel(id, ref options) => (49, id, options).serialize(serializer),
            Message::Invocation(id, registration_id, ref details, ref args, ref kwargs) => {
                serialize_with_args!(args, kwargs, serializer, 68, id, registration_id, details)
            }
            Message::Interrupt(id, ref options) => (69, id, options).serialize(serializer),
            Message::Yield(id, ref options, ref args, ref kwargs) => {
                serialize_with_args!(args, kwargs, serializer, 70, id, options)
            }
            Message::Result(id, ref details, ref args, ref kwargs) => {
                serialize_with_args!(args, kwargs, serializer, 50, id, details)
            }
        }
    }
}

impl<'de> serde::Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> Result<Message, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(MessageVisitor)
    }
}

struct MessageVisitor;

impl MessageVisitor {
    fn visit_hello<'de, V>(&self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let uri = next_field!(visitor, "Hello message ended before realm uri");
        let details = next_field!(visitor, "Hello message ended before details dict");
        Ok(Message::Hello(uri, details))
    }

    fn visit_welcome<'de, V>(&self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let session = next_field!(visitor, "Welcome message ended before session id");
        let details = next_field!(visitor, "Welcome message ended before details dict");
        Ok(Message::Welcome(session, details))
    }

    fn visit_abort<'de, V>(&self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let details = next_field!(visitor, "Abort message ended before details dict");
        let reason = next_field!(visitor, "Abort message ended before reason uri");
        Ok(Message::Abort(details, reason))
    }

    fn visit_goodbye<'de, V>(&self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let details = next_field!(visitor, "Goodbye message ended before details dict");
        let reason = next_field!(visitor, "Goodbye message ended before reason uri");
        Ok(Message::Goodbye(details, reason))
    }

    fn visit_error<'de, V>(&self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let message_type = next_field!(visitor, "Error message ended before message type");
        let id = next_field!(visitor, "Error message ended before session id");
        let details = next_field!(visitor, "Error message ended before details dict");
        let reason = next_field!(visitor, "Error message ended before reason uri");
        let args = visitor.next_element()?;
        let kwargs = visitor.next_element()?;
        Ok(Message::Error(
            message_type,
            id,
            details,
            reason,
            args,
            kwargs,
        ))
    }

    fn visit_subscribe<'de, V>(&self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let request = next_field!(visitor, "Subscribe message ended before request id");
        let options = next_field!(visitor, "Subscribe message ended before options dict");
        let topic = next_field!(visitor, "Subscribe message ended before topic uri");
        Ok(Message::Subscribe(request, options, topic))
    }

    fn visit_subscribed<'de, V>(&self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let request = next_field!(visitor, "Subscribed message ended before request id");
        let subscription = next_field!(visitor, "Subscribed message ended before subscription id");
        Ok(Message::Subscribed(request, subscription))
    }

    fn visit_unsubscribe<'de, V>(&self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let request = next_field!(visitor, "Unsubscribe message ended before request id");
        let subscription =
            next_field!(visitor, "Unsubscribe message ended before subscription id");
        Ok(Message::Unsubscribe(request, subscription))
    }

    fn visit_unsubscribed<'de, V>(&self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let request = next_field!(visitor, "Unsubscribed message ended before request id");
        Ok(Message::Unsubscribed(request))
    }

    fn visit_publish<'de, V>(&self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let id = next_field!(visitor, "Publish message ended before session id");
        let details = next_field!(visitor, "Publish message ended before details dict");
        let topic = next_field!(visitor, "Publish message ended before topic uri");
        let args = visitor.next_element()?;
        let kwargs = visitor.next_element()?;
        Ok(Message::Publish(id, details, topic, args, kwargs))
    }

    fn visit_published<'de, V>(&self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let request = next_field!(visitor, "Published message ended before request id");
        let publication = next_field!(visitor, "Published message ended before publication id");
        Ok(Message::Published(request, publication))
    }

    fn visit_event<'de, V>(&self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let subscription_id = next_field!(
            visitor,
            "Event message ended before session subscription id"
        );
        let publication_id = next_field!(visitor, "Event message ended before publication id");
        let details = next_field!(visitor, "Event message ended before details dict");
        let args = visitor.next_element()?;
        let kwargs = visitor.next_element()?;
        Ok(Message::Event(
            subscription_id,
            publication_id,
            details,
            args,
            kwargs,
        ))
    }

    fn visit_register<'de, V>(&self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let request = next_field!(visitor, "Register message ended before request id");
        let options = next_field!(visitor, "Register message ended before request options");
        let procedure = next_field!(visitor, "Register message ended before procedure");
        Ok(Message::Register(request, options, procedure))
    }

    fn visit_registered<'de, V>(&self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let request = next_field!(visitor, "Registered message ended before request id");
        let registration_id =
            next_field!(visitor, "Registered message ended before registration id");
        Ok(Message::Registered(request, registration_id))
    }

    fn visit_unregister<'de, V>(&self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let request = next_field!(visitor, "Unregister message ended before request id");
        let registration_id =
            next_field!(visitor, "Unregister message ended before registration id");
        Ok(Message::Unregister(request, registration_id))
    }

    fn visit_unregistered<'de, V>(&self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let request = next_field!(visitor, "Unregistered message ended before request id");
        Ok(Message::Unregistered(request))
    }

    fn visit_call<'de, V>(&self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let id = next_field!(visitor, "Call message ended before session id");
        let options = next_field!(visitor, "Call message ended before options dict");
        let topic = next_field!(visitor, "Call message ended before procedure uri");
        let args = visitor.next_element()?;
        let kwargs = visitor.next_element()?;
        Ok(Message::Call(id, options, topic, args, kwargs))
    }

    fn visit_cancel<'de, V>(&self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let id = next_field!(visitor, "Cancel message ended before call id");
        let options = next_field!(visitor, "Cancel message ended before options dict");
        Ok(Message::Cancel(id, options))
    }

    fn visit_invocation<'de, V>(&self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let id = next_field!(visitor, "Invocation message ended before session id");
        let registration_id =
            next_field!(visitor, "Invocation message ended before registration id");
        let details = next_field!(visitor, "Invocation message ended before details dict");
        let args = visitor.next_element()?;
        let kwargs = visitor.next_element()?;
        Ok(Message::Invocation(
            id,
            registration_id,
            details,
            args,
            kwargs,
        ))
    }

    fn visit_interrupt<'de, V>(&self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let id = next_field!(visitor, "Interrupt message ended before invocation id");
        let options = next_field!(visitor, "Interrupt message ended before options dict");
        Ok(Message::Interrupt(id, options))
    }

    fn visit_yield<'de, V>(&self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let id = next_field!(visitor, "Yield message ended before session id");
        let options = next_field!(visitor, "Yield message ended before options dict");
        let args = visitor.next_element()?;
        let kwargs = visitor.next_element()?;
        Ok(Message::Yield(id, options, args, kwargs))
    }

    fn visit_result<'de, V>(&self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let id = next_field!(visitor, "Result message ended before session id");
        let details = next_field!(visitor, "Result message ended before details dict");
        let args = visitor.next_element()?;
        let kwargs = visitor.next_element()?;
        Ok(Message::Result(id, details, args, kwargs))
    }
}

impl<'de> serde::de::Visitor<'de> for MessageVisitor {
    type Value = Message;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a message")
    }

    fn visit_seq<V>(self, mut visitor: V) -> Result<Message, V::Error>
    where
        V: serde::de::SeqAccess<'de>,
    {
        let message_type: u64 = next_field!(visitor, "No message type found");
        match message_type {
            1 => self.visit_hello(visitor),
            2 => self.visit_welcome(visitor),
            3 => self.visit_abort(visitor),
            6 => self.visit_goodbye(visitor),
            8 => self.visit_error(visitor),
            32 => self.visit_subscribe(visitor),
            33 => self.visit_subscribed(visitor),
            34 => self.visit_unsubscribe(visitor),
            35 => self.visit_unsubscribed(visitor),
            16 => self.visit_publish(visitor),
            17 => self.visit_published(visitor),
            36 => self.visit_event(visitor),
            64 => self.visit_register(visitor),
            65 => self.visit_registered(visitor),
            66 => self.visit_unregister(visitor),
            67 => self.visit_unregistered(visitor),
            48 => self.visit_call(visitor),
            49 => self.visit_cancel(visitor),
            68 => self.visit_invocation(visitor),
            69 => self.visit_interrupt(visitor),
            70 => self.visit_yield(visitor),
            50 => self.visit_result(visitor),
            _ => Err(serde::de::Error::custom("Unknown message type")),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Message;
    use crate::messages::{ErrorType, Reason, Value};
    use std::collections::HashMap;

    macro_rules! two_way_test {
        ($message:expr, $s:expr) => {{
            let message = $message;
            assert_eq!(serde_json::to_string(&message).unwrap(), $s);
            assert_eq!(serde_json::from_str::<Message>($s).unwrap(), message);
        }};
    }

    #[test]
    fn serialize_hello() {
        two_way_test!(
            Message::Hello(crate::URI::new("ca.dal.wamp.test"), HashMap::new()),
            "[1,\"ca.dal.wamp.test\",{}]"
        );
    }

    #[test]
    fn serialize_welcome() {
        two_way_test!(Message::Welcome(493782, HashMap::new()), "[2,493782,{}]");
    }

    #[test]
    fn serialize_abort() {
        two_way_test!(
            Message::Abort(HashMap::new(), Reason::NoSuchRealm),
            "[3,{},\"wamp.error.no_such_realm\"]"
        );
    }

    #[test]
    fn serialize_goodbye() {
        two_way_test!(
            Message::Goodbye(HashMap::new(), Reason::GoodbyeAndOut),
            "[6,{},\"wamp.error.goodbye_and_out\"]"
        );
    }

    #[test]
    fn serialize_error() {
        two_way_test!(
            Message::Error(
                ErrorType::Subscribe,
                713845233,
                HashMap::new(),
                Reason::NotAuthorized,
                None,
                None
            ),
            "[8,32,713845233,{},\"wamp.error.not_authorized\"]"
        );
    }

    #[test]
    fn serialize_subscribe() {
        two_way_test!(
            Message::Subscribe(
                58944,
                HashMap::new(),
                crate::URI::new("ca.dal.test.the_sub")
            ),
            "[32,58944,{},\"ca.dal.test.the_sub\"]"
        )
    }

    #[test]
    fn serialize_call_with_args() {
        two_way_test!(
            Message::Call(
                764346,
                HashMap::new(),
                crate::URI::new("com.myapp.echo"),
                Some(vec![Value::String("a value".to_string())]),
                None
            ),
            "[48,764346,{},\"com.myapp.echo\",[\"a value\"]]"
        );
    }

    #[test]
    fn serialize_cancel() {
        two_way_test!(
            Message::Cancel(764346, HashMap::new()),
            "[49,764346,{}]"
        );
    }

    #[test]
    fn serialize_interrupt() {
        two_way_test!(
            Message::Interrupt(9823526, HashMap::new()),
            "[69,9823526,{}]"
        );
    }

    #[test]
    fn serialize_yield() {
        two_way_test!(Message::Yield(6131533, HashMap::new(), None, None), "[70,6131533,{}]");
    }

    #[test]
    fn serialize_result() {
        two_way_test!(Message::Result(7814135, HashMap::new(), None, None), "[50,7814135,{}]");
    }
}
