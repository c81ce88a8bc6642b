/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
MQTT5 property lists.

A property list is an ordered sequence of typed key-value pairs.  Which identifiers may appear in
which packet (and how many times) is fixed by the protocol; [`read_properties`] enforces that table
on the way in and [`validate_properties`] enforces it on the way out.
 */

use crate::decode::utils::*;
use crate::encode::utils::*;
use crate::error::{DimqError, DimqResult};

use log::*;

use std::fmt;

/// Every property identifier defined by MQTT5.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum PropertyIdentifier {
    PayloadFormatIndicator = 1,
    MessageExpiryInterval = 2,
    ContentType = 3,
    ResponseTopic = 8,
    CorrelationData = 9,
    SubscriptionIdentifier = 11,
    SessionExpiryInterval = 17,
    AssignedClientIdentifier = 18,
    ServerKeepAlive = 19,
    AuthenticationMethod = 21,
    AuthenticationData = 22,
    RequestProblemInformation = 23,
    WillDelayInterval = 24,
    RequestResponseInformation = 25,
    ResponseInformation = 26,
    ServerReference = 28,
    ReasonString = 31,
    ReceiveMaximum = 33,
    TopicAliasMaximum = 34,
    TopicAlias = 35,
    MaximumQos = 36,
    RetainAvailable = 37,
    UserProperty = 38,
    MaximumPacketSize = 39,
    WildcardSubscriptionAvailable = 40,
    SubscriptionIdentifiersAvailable = 41,
    SharedSubscriptionAvailable = 42,
}

/// Wire representation of a property's value
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PropertyType {
    Byte,
    U16,
    U32,
    VarInt,
    Binary,
    String,
    StringPair,
}

impl PropertyIdentifier {

    /// Looks up an identifier by its wire value
    pub fn from_u32(value: u32) -> Option<PropertyIdentifier> {
        use PropertyIdentifier::*;

        let identifier = match value {
            1 => PayloadFormatIndicator,
            2 => MessageExpiryInterval,
            3 => ContentType,
            8 => ResponseTopic,
            9 => CorrelationData,
            11 => SubscriptionIdentifier,
            17 => SessionExpiryInterval,
            18 => AssignedClientIdentifier,
            19 => ServerKeepAlive,
            21 => AuthenticationMethod,
            22 => AuthenticationData,
            23 => RequestProblemInformation,
            24 => WillDelayInterval,
            25 => RequestResponseInformation,
            26 => ResponseInformation,
            28 => ServerReference,
            31 => ReasonString,
            33 => ReceiveMaximum,
            34 => TopicAliasMaximum,
            35 => TopicAlias,
            36 => MaximumQos,
            37 => RetainAvailable,
            38 => UserProperty,
            39 => MaximumPacketSize,
            40 => WildcardSubscriptionAvailable,
            41 => SubscriptionIdentifiersAvailable,
            42 => SharedSubscriptionAvailable,
            _ => { return None; }
        };

        Some(identifier)
    }

    /// The value type this identifier carries on the wire
    pub fn value_type(&self) -> PropertyType {
        use PropertyIdentifier::*;

        match self {
            PayloadFormatIndicator | RequestProblemInformation | RequestResponseInformation | MaximumQos |
            RetainAvailable | WildcardSubscriptionAvailable | SubscriptionIdentifiersAvailable |
            SharedSubscriptionAvailable => { PropertyType::Byte }
            ServerKeepAlive | ReceiveMaximum | TopicAliasMaximum | TopicAlias => { PropertyType::U16 }
            MessageExpiryInterval | SessionExpiryInterval | WillDelayInterval | MaximumPacketSize => { PropertyType::U32 }
            SubscriptionIdentifier => { PropertyType::VarInt }
            CorrelationData | AuthenticationData => { PropertyType::Binary }
            ContentType | ResponseTopic | AssignedClientIdentifier | AuthenticationMethod |
            ResponseInformation | ServerReference | ReasonString => { PropertyType::String }
            UserProperty => { PropertyType::StringPair }
        }
    }

    fn is_boolean(&self) -> bool {
        use PropertyIdentifier::*;

        matches!(self, PayloadFormatIndicator | RequestProblemInformation | RequestResponseInformation |
            MaximumQos | RetainAvailable | WildcardSubscriptionAvailable | SubscriptionIdentifiersAvailable |
            SharedSubscriptionAvailable)
    }
}

impl fmt::Display for PropertyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, *self as u8)
    }
}

/// A property value
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PropertyValue {
    Byte(u8),
    U16(u16),
    U32(u32),
    VarInt(u32),
    Binary(Vec<u8>),
    String(String),
    StringPair(String, String),
}

impl PropertyValue {

    /// The wire type of this value
    pub fn value_type(&self) -> PropertyType {
        match self {
            PropertyValue::Byte(_) => { PropertyType::Byte }
            PropertyValue::U16(_) => { PropertyType::U16 }
            PropertyValue::U32(_) => { PropertyType::U32 }
            PropertyValue::VarInt(_) => { PropertyType::VarInt }
            PropertyValue::Binary(_) => { PropertyType::Binary }
            PropertyValue::String(_) => { PropertyType::String }
            PropertyValue::StringPair(_, _) => { PropertyType::StringPair }
        }
    }

    fn encoded_length(&self) -> usize {
        match self {
            PropertyValue::Byte(_) => { 1 }
            PropertyValue::U16(_) => { 2 }
            PropertyValue::U32(_) => { 4 }
            PropertyValue::VarInt(value) => { compute_variable_length_integer_encode_size(*value as usize).unwrap_or(4) }
            PropertyValue::Binary(value) => { 2 + value.len() }
            PropertyValue::String(value) => { 2 + value.len() }
            PropertyValue::StringPair(name, value) => { 4 + name.len() + value.len() }
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Byte(value) => { write!(f, "{}", value) }
            PropertyValue::U16(value) => { write!(f, "{}", value) }
            PropertyValue::U32(value) => { write!(f, "{}", value) }
            PropertyValue::VarInt(value) => { write!(f, "{}", value) }
            PropertyValue::Binary(value) => { write!(f, "<{} Bytes>", value.len()) }
            PropertyValue::String(value) => { write!(f, "\"{}\"", value) }
            PropertyValue::StringPair(name, value) => { write!(f, "(\"{}\",\"{}\")", name, value) }
        }
    }
}

/// A single identifier-value pair
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Property {
    pub identifier: PropertyIdentifier,
    pub value: PropertyValue,
}

/// The packet (or will) a property list belongs to.  Selects the allow table used for validation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PropertyContext {
    Connect,
    Will,
    Connack,
    Publish,
    Puback,
    Pubrec,
    Pubrel,
    Pubcomp,
    Subscribe,
    Suback,
    Unsubscribe,
    Unsuback,
    Disconnect,
    Auth,
}

impl fmt::Display for PropertyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

fn is_property_allowed(identifier: PropertyIdentifier, context: PropertyContext) -> bool {
    use PropertyIdentifier::*;
    use PropertyContext as C;

    match identifier {
        PayloadFormatIndicator | MessageExpiryInterval | ContentType | ResponseTopic | CorrelationData => {
            matches!(context, C::Publish | C::Will)
        }
        SubscriptionIdentifier => { matches!(context, C::Publish | C::Subscribe) }
        SessionExpiryInterval => { matches!(context, C::Connect | C::Connack | C::Disconnect) }
        AssignedClientIdentifier | ServerKeepAlive | ResponseInformation | MaximumQos | RetainAvailable |
        WildcardSubscriptionAvailable | SubscriptionIdentifiersAvailable | SharedSubscriptionAvailable => {
            context == C::Connack
        }
        AuthenticationMethod | AuthenticationData => { matches!(context, C::Connect | C::Connack | C::Auth) }
        RequestProblemInformation | RequestResponseInformation => { context == C::Connect }
        WillDelayInterval => { context == C::Will }
        ServerReference => { matches!(context, C::Connack | C::Disconnect) }
        ReasonString => {
            matches!(context, C::Connack | C::Puback | C::Pubrec | C::Pubrel | C::Pubcomp | C::Suback |
                C::Unsuback | C::Disconnect | C::Auth)
        }
        ReceiveMaximum | TopicAliasMaximum | MaximumPacketSize => { matches!(context, C::Connect | C::Connack) }
        TopicAlias => { context == C::Publish }
        UserProperty => { true }
    }
}

fn is_property_repeatable(identifier: PropertyIdentifier, context: PropertyContext) -> bool {
    match identifier {
        PropertyIdentifier::UserProperty => { true }
        PropertyIdentifier::SubscriptionIdentifier => { context == PropertyContext::Publish }
        _ => { false }
    }
}

fn validate_property_value(property: &Property) -> DimqResult<()> {
    if property.identifier.value_type() != property.value.value_type() {
        error!("Property Validation - {} carries a value of the wrong type", property.identifier);
        return Err(DimqError::new_protocol_error("property value has the wrong type"));
    }

    match (&property.identifier, &property.value) {
        (identifier, PropertyValue::Byte(value)) if identifier.is_boolean() => {
            if *value > 1 {
                error!("Property Validation - {} must be 0 or 1, found {}", identifier, value);
                return Err(DimqError::new_protocol_error("boolean property value out of range"));
            }
        }
        (PropertyIdentifier::ReceiveMaximum, PropertyValue::U16(0)) |
        (PropertyIdentifier::TopicAlias, PropertyValue::U16(0)) |
        (PropertyIdentifier::MaximumPacketSize, PropertyValue::U32(0)) |
        (PropertyIdentifier::SubscriptionIdentifier, PropertyValue::VarInt(0)) => {
            error!("Property Validation - {} may not be zero", property.identifier);
            return Err(DimqError::new_protocol_error("property value may not be zero"));
        }
        (PropertyIdentifier::SubscriptionIdentifier, PropertyValue::VarInt(value)) => {
            if *value as usize > MAXIMUM_VARIABLE_LENGTH_INTEGER {
                return Err(DimqError::new_payload_too_large("subscription identifier exceeds variable length integer maximum"));
            }
        }
        _ => {}
    }

    Ok(())
}

/// Ordered list of MQTT5 properties attached to a packet or will.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PropertyList {
    properties: Vec<Property>,
}

impl PropertyList {

    /// Creates an empty property list
    pub fn new() -> Self {
        PropertyList::default()
    }

    /// Appends a property.  Fails if the value type does not match the identifier, if the value
    /// is out of range, or if the identifier can never repeat and is already present.
    pub fn add(&mut self, identifier: PropertyIdentifier, value: PropertyValue) -> DimqResult<()> {
        let property = Property { identifier, value };
        validate_property_value(&property)?;

        let repeatable = identifier == PropertyIdentifier::UserProperty || identifier == PropertyIdentifier::SubscriptionIdentifier;
        if !repeatable && self.get(identifier).is_some() {
            return Err(DimqError::new_duplicate_property(identifier as u8));
        }

        self.properties.push(property);
        Ok(())
    }

    /// Replaces every occurrence of `identifier` with a single property holding `value`
    pub fn set(&mut self, identifier: PropertyIdentifier, value: PropertyValue) -> DimqResult<()> {
        let property = Property { identifier, value };
        validate_property_value(&property)?;

        self.remove(identifier);
        self.properties.push(property);
        Ok(())
    }

    /// Appends a user property name-value pair
    pub fn add_user_property(&mut self, name: &str, value: &str) {
        self.properties.push(Property {
            identifier: PropertyIdentifier::UserProperty,
            value: PropertyValue::StringPair(name.to_string(), value.to_string()),
        });
    }

    /// Removes every occurrence of `identifier`, returning how many were removed
    pub fn remove(&mut self, identifier: PropertyIdentifier) -> usize {
        let before = self.properties.len();
        self.properties.retain(|property| property.identifier != identifier);
        before - self.properties.len()
    }

    /// First value for `identifier`, if any
    pub fn get(&self, identifier: PropertyIdentifier) -> Option<&PropertyValue> {
        self.properties.iter().find(|property| property.identifier == identifier).map(|property| &property.value)
    }

    /// Every value for `identifier`, in insertion order
    pub fn get_all(&self, identifier: PropertyIdentifier) -> impl Iterator<Item = &PropertyValue> {
        self.properties.iter().filter(move |property| property.identifier == identifier).map(|property| &property.value)
    }

    pub fn get_byte(&self, identifier: PropertyIdentifier) -> Option<u8> {
        match self.get(identifier) {
            Some(PropertyValue::Byte(value)) => { Some(*value) }
            _ => { None }
        }
    }

    pub fn get_u16(&self, identifier: PropertyIdentifier) -> Option<u16> {
        match self.get(identifier) {
            Some(PropertyValue::U16(value)) => { Some(*value) }
            _ => { None }
        }
    }

    pub fn get_u32(&self, identifier: PropertyIdentifier) -> Option<u32> {
        match self.get(identifier) {
            Some(PropertyValue::U32(value)) => { Some(*value) }
            _ => { None }
        }
    }

    pub fn get_varint(&self, identifier: PropertyIdentifier) -> Option<u32> {
        match self.get(identifier) {
            Some(PropertyValue::VarInt(value)) => { Some(*value) }
            _ => { None }
        }
    }

    pub fn get_string(&self, identifier: PropertyIdentifier) -> Option<&str> {
        match self.get(identifier) {
            Some(PropertyValue::String(value)) => { Some(value.as_str()) }
            _ => { None }
        }
    }

    pub fn get_binary(&self, identifier: PropertyIdentifier) -> Option<&[u8]> {
        match self.get(identifier) {
            Some(PropertyValue::Binary(value)) => { Some(value.as_slice()) }
            _ => { None }
        }
    }

    /// User properties as name-value pairs, in insertion order
    pub fn user_properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties.iter().filter_map(|property| {
            if let PropertyValue::StringPair(name, value) = &property.value {
                Some((name.as_str(), value.as_str()))
            } else {
                None
            }
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.properties.iter()
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

impl fmt::Display for PropertyList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for property in &self.properties {
            write!(f, " {:?}:{}", property.identifier, property.value)?;
        }
        write!(f, " ]")
    }
}

/// Encoded size of the property section content, excluding its variable length integer prefix
pub fn get_remaining_length(properties: &PropertyList) -> usize {
    properties.properties.iter().map(|property| 1 + property.value.encoded_length()).sum()
}

/// Encoded size of the entire property section, including its length prefix
pub(crate) fn compute_property_section_length(properties: &PropertyList) -> DimqResult<usize> {
    let content_length = get_remaining_length(properties);
    Ok(content_length + compute_variable_length_integer_encode_size(content_length)?)
}

/// Checks an outbound property list against the allow table for `context`
pub(crate) fn validate_properties(context: PropertyContext, properties: &PropertyList) -> DimqResult<()> {
    let mut seen : Vec<PropertyIdentifier> = Vec::with_capacity(properties.len());
    for property in &properties.properties {
        check_property(context, property, &seen)?;
        seen.push(property.identifier);
    }

    Ok(())
}

fn check_property(context: PropertyContext, property: &Property, seen: &[PropertyIdentifier]) -> DimqResult<()> {
    if !is_property_allowed(property.identifier, context) {
        error!("Property Validation - {} is not valid in a {} property list", property.identifier, context);
        return Err(DimqError::new_protocol_error("property not allowed for this packet"));
    }

    if !is_property_repeatable(property.identifier, context) && seen.contains(&property.identifier) {
        error!("Property Validation - {} appears more than once in a {} property list", property.identifier, context);
        return Err(DimqError::new_duplicate_property(property.identifier as u8));
    }

    validate_property_value(property)
}

/// Writes a property section (length prefix followed by properties) to `dest`
pub fn write_properties(properties: &PropertyList, dest: &mut Vec<u8>) -> DimqResult<()> {
    write_properties_with_length(properties, get_remaining_length(properties), dest)
}

pub(crate) fn write_properties_with_length(properties: &PropertyList, length: usize, dest: &mut Vec<u8>) -> DimqResult<()> {
    encode_vli(length, dest)?;

    for property in &properties.properties {
        encode_u8(dest, property.identifier as u8);
        match &property.value {
            PropertyValue::Byte(value) => { encode_u8(dest, *value); }
            PropertyValue::U16(value) => { encode_u16(dest, *value); }
            PropertyValue::U32(value) => { encode_u32(dest, *value); }
            PropertyValue::VarInt(value) => { encode_varint(*value, dest)?; }
            PropertyValue::Binary(value) => { encode_length_prefixed_bytes(dest, value)?; }
            PropertyValue::String(value) => { encode_length_prefixed_string(dest, value)?; }
            PropertyValue::StringPair(name, value) => {
                encode_length_prefixed_string(dest, name)?;
                encode_length_prefixed_string(dest, value)?;
            }
        }
    }

    Ok(())
}

fn read_property_value<'a>(value_type: PropertyType, bytes: &'a[u8]) -> DimqResult<(PropertyValue, &'a[u8])> {
    match value_type {
        PropertyType::Byte => {
            let mut value = 0;
            let remaining = decode_u8(bytes, &mut value)?;
            Ok((PropertyValue::Byte(value), remaining))
        }
        PropertyType::U16 => {
            let mut value = 0;
            let remaining = decode_u16(bytes, &mut value)?;
            Ok((PropertyValue::U16(value), remaining))
        }
        PropertyType::U32 => {
            let mut value = 0;
            let remaining = decode_u32(bytes, &mut value)?;
            Ok((PropertyValue::U32(value), remaining))
        }
        PropertyType::VarInt => {
            let mut value = 0;
            let remaining = decode_vli_into_mutable(bytes, &mut value)?;
            Ok((PropertyValue::VarInt(value as u32), remaining))
        }
        PropertyType::Binary => {
            let mut value = Vec::new();
            let remaining = decode_length_prefixed_bytes(bytes, &mut value)?;
            Ok((PropertyValue::Binary(value), remaining))
        }
        PropertyType::String => {
            let mut value = String::new();
            let remaining = decode_length_prefixed_string(bytes, &mut value)?;
            Ok((PropertyValue::String(value), remaining))
        }
        PropertyType::StringPair => {
            let mut name = String::new();
            let mut value = String::new();
            let mut remaining = decode_length_prefixed_string(bytes, &mut name)?;
            remaining = decode_length_prefixed_string(remaining, &mut value)?;
            Ok((PropertyValue::StringPair(name, value), remaining))
        }
    }
}

/// Reads a property section (length prefix followed by properties) from the front of `bytes`,
/// validating every property against the allow table for `context`.  Returns the decoded list and
/// the bytes following the property section.
pub fn read_properties(context: PropertyContext, bytes: &[u8]) -> DimqResult<(PropertyList, &[u8])> {
    let mut section_length = 0;
    let after_length = decode_vli_into_mutable(bytes, &mut section_length)?;
    if section_length > after_length.len() {
        error!("{} Properties Decode - property section length exceeds remaining bytes", context);
        return Err(DimqError::new_malformed_packet("property section length exceeds remaining bytes"));
    }

    let mut property_bytes = &after_length[..section_length];
    let mut list = PropertyList::new();
    let mut seen : Vec<PropertyIdentifier> = Vec::new();

    while !property_bytes.is_empty() {
        let mut raw_identifier = 0;
        property_bytes = decode_vli_into_mutable(property_bytes, &mut raw_identifier)?;

        let identifier = match PropertyIdentifier::from_u32(raw_identifier as u32) {
            Some(identifier) => { identifier }
            None => {
                error!("{} Properties Decode - unknown property identifier ({})", context, raw_identifier);
                return Err(DimqError::new_malformed_packet("unknown property identifier"));
            }
        };

        let (value, remaining) = read_property_value(identifier.value_type(), property_bytes)?;
        property_bytes = remaining;

        let property = Property { identifier, value };
        check_property(context, &property, &seen)?;

        seen.push(identifier);
        list.properties.push(property);
    }

    Ok((list, &after_length[section_length..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn publish_properties_round_trip() {
        let mut properties = PropertyList::new();
        properties.add(PropertyIdentifier::MessageExpiryInterval, PropertyValue::U32(3600)).unwrap();
        properties.add(PropertyIdentifier::ContentType, PropertyValue::String("application/json".to_string())).unwrap();
        properties.add(PropertyIdentifier::SubscriptionIdentifier, PropertyValue::VarInt(300)).unwrap();
        properties.add(PropertyIdentifier::SubscriptionIdentifier, PropertyValue::VarInt(7)).unwrap();
        properties.add_user_property("origin", "sensor-1");
        properties.add_user_property("origin", "sensor-2");

        let mut dest = Vec::new();
        write_properties(&properties, &mut dest).unwrap();
        dest.push(0xAA);

        assert_eq!(compute_property_section_length(&properties).unwrap() + 1, dest.len());

        let (decoded, remaining) = read_properties(PropertyContext::Publish, &dest).unwrap();
        assert_eq!(properties, decoded);
        assert_eq!(&[0xAAu8], remaining);
        assert_eq!(2, decoded.get_all(PropertyIdentifier::SubscriptionIdentifier).count());
        assert_eq!(Some(3600), decoded.get_u32(PropertyIdentifier::MessageExpiryInterval));
    }

    #[test]
    fn property_not_allowed_for_command_is_protocol_error() {
        let mut properties = PropertyList::new();
        properties.add(PropertyIdentifier::TopicAlias, PropertyValue::U16(3)).unwrap();

        let mut dest = Vec::new();
        write_properties(&properties, &mut dest).unwrap();

        assert_matches!(read_properties(PropertyContext::Connect, &dest), Err(DimqError::ProtocolError(_)));
        assert_matches!(validate_properties(PropertyContext::Suback, &properties), Err(DimqError::ProtocolError(_)));
        assert!(read_properties(PropertyContext::Publish, &dest).is_ok());
    }

    #[test]
    fn duplicate_property_detected() {
        // two session expiry intervals in a CONNECT property section
        let bytes = [10u8, 17, 0, 0, 0, 1, 17, 0, 0, 0, 2];
        assert_matches!(read_properties(PropertyContext::Connect, &bytes), Err(DimqError::DuplicateProperty(context)) => {
            assert_eq!(17, context.identifier);
        });

        // subscription identifier may only repeat inside PUBLISH
        let bytes = [4u8, 11, 1, 11, 2];
        assert_matches!(read_properties(PropertyContext::Subscribe, &bytes), Err(DimqError::DuplicateProperty(_)));
        assert!(read_properties(PropertyContext::Publish, &bytes).is_ok());
    }

    #[test]
    fn unknown_identifier_is_hard_error() {
        let bytes = [2u8, 0x07, 0x00];
        assert_matches!(read_properties(PropertyContext::Publish, &bytes), Err(DimqError::MalformedPacket(_)));
    }

    #[test]
    fn invalid_values_rejected() {
        let mut properties = PropertyList::new();
        assert_matches!(properties.add(PropertyIdentifier::ReceiveMaximum, PropertyValue::U16(0)), Err(DimqError::ProtocolError(_)));
        assert_matches!(properties.add(PropertyIdentifier::PayloadFormatIndicator, PropertyValue::Byte(2)), Err(DimqError::ProtocolError(_)));
        assert_matches!(properties.add(PropertyIdentifier::ContentType, PropertyValue::U32(2)), Err(DimqError::ProtocolError(_)));

        let bytes = [2u8, 36, 2];
        assert_matches!(read_properties(PropertyContext::Connack, &bytes), Err(DimqError::ProtocolError(_)));
    }

    #[test]
    fn truncated_section_is_malformed() {
        let bytes = [5u8, 17, 0, 0];
        assert_matches!(read_properties(PropertyContext::Connect, &bytes), Err(DimqError::MalformedPacket(_)));

        let bytes = [3u8, 17, 0, 0];
        assert_matches!(read_properties(PropertyContext::Connect, &bytes), Err(DimqError::MalformedPacket(_)));
    }

    #[test]
    fn set_replaces_existing_value() {
        let mut properties = PropertyList::new();
        properties.add(PropertyIdentifier::MessageExpiryInterval, PropertyValue::U32(60)).unwrap();
        properties.set(PropertyIdentifier::MessageExpiryInterval, PropertyValue::U32(15)).unwrap();
        assert_eq!(1, properties.len());
        assert_eq!(Some(15), properties.get_u32(PropertyIdentifier::MessageExpiryInterval));
        assert_eq!(1, properties.remove(PropertyIdentifier::MessageExpiryInterval));
        assert!(properties.is_empty());
    }
}
