//! Line commands and notice rendering for the driver console

use ridesync_core::{
    ChannelId, ChatMessage, MessageStatus, PresenceStop, RideId, RideOffer, SessionNotice, TicketId,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Online,
    Offline,
    Accept,
    Decline,
    Advance,
    Refresh,
    Status,
    Chat(ChannelId),
    Say(String),
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  online | offline      toggle availability
  accept | decline      answer the current offer
  advance               move the active ride to its next status
  refresh               reload driver status from the backend
  status                show offer, ride and connection
  chat <ride id>        open the chat for a ride
  support <ticket id>   open a support ticket thread
  say <text>            send to the open chat
  quit";

pub fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word.to_ascii_lowercase().as_str() {
        "online" => Command::Online,
        "offline" => Command::Offline,
        "accept" => Command::Accept,
        "decline" => Command::Decline,
        "advance" => Command::Advance,
        "refresh" => Command::Refresh,
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        "chat" => {
            let ride_id = rest
                .parse::<i64>()
                .map_err(|_| format!("not a ride id: {:?}", rest))?;
            Command::Chat(ChannelId::Ride(RideId(ride_id)))
        }
        "support" if !rest.is_empty() => {
            Command::Chat(ChannelId::Support(TicketId(rest.to_string())))
        }
        "say" if !rest.is_empty() => Command::Say(rest.to_string()),
        "support" | "say" => return Err(format!("{} needs an argument", word)),
        "" => return Err("empty command".to_string()),
        other => return Err(format!("unknown command {:?}, try `help`", other)),
    };
    Ok(command)
}

pub fn describe_offer(offer: &RideOffer) -> String {
    let mut text = format!("ride {}", offer.ride_id);
    if let (Some(from), Some(to)) = (&offer.origin_address, &offer.destination_address) {
        text.push_str(&format!(": {} -> {}", from, to));
    }
    if let Some(fare) = offer.fare_estimate {
        text.push_str(&format!(", fare {:.0}", fare));
    }
    if let Some(distance) = offer.distance_km {
        text.push_str(&format!(", {:.1} km", distance));
    }
    if let Some(minutes) = offer.duration_min {
        text.push_str(&format!(", ~{:.0} min", minutes));
    }
    text
}

pub fn describe_message(message: &ChatMessage) -> String {
    let marker = match message.status {
        MessageStatus::Pending => " (sending)",
        MessageStatus::Failed => " (failed)",
        MessageStatus::Sent | MessageStatus::Delivered => "",
    };
    format!(
        "[{}] {}: {}{}",
        message.created_at.format("%H:%M"),
        message.sender_id,
        message.content,
        marker
    )
}

pub fn describe_notice(notice: &SessionNotice) -> String {
    match notice {
        SessionNotice::OfferReceived(offer) => format!("New offer: {}", describe_offer(offer)),
        SessionNotice::OfferWithdrawn { ride_id, reason } => match reason {
            Some(reason) => format!("Offer for ride {} withdrawn: {}", ride_id, reason),
            None => format!("Offer for ride {} withdrawn", ride_id),
        },
        SessionNotice::RideInterrupted {
            ride_id,
            status,
            reason,
        } => match reason {
            Some(reason) => format!("Ride {} {} by rider: {}", ride_id, status, reason),
            None => format!("Ride {} {} by rider", ride_id, status),
        },
        SessionNotice::RideStatusChanged { ride_id, status } => {
            format!("Ride {} is now {}", ride_id, status)
        }
        SessionNotice::PresenceStopped(PresenceStop::PermissionRevoked) => {
            "Location unavailable, you are now offline".to_string()
        }
        SessionNotice::ReauthRequired => "Session expired, sign in again".to_string(),
        SessionNotice::ChatMessage { channel, message } => {
            format!("{} {}", channel, describe_message(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ridesync_core::RideStatus;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse("online"), Ok(Command::Online));
        assert_eq!(parse("  ADVANCE "), Ok(Command::Advance));
        assert_eq!(
            parse("chat 42"),
            Ok(Command::Chat(ChannelId::Ride(RideId(42))))
        );
        assert_eq!(
            parse("support t-7"),
            Ok(Command::Chat(ChannelId::Support(TicketId("t-7".to_string()))))
        );
        assert_eq!(
            parse("say  I am at the gate"),
            Ok(Command::Say("I am at the gate".to_string()))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("chat abc").is_err());
        assert!(parse("say").is_err());
        assert!(parse("teleport").is_err());
    }

    #[test]
    fn test_describe_offer() {
        let mut offer = RideOffer::new(RideId(5));
        offer.origin_address = Some("Yaba".to_string());
        offer.destination_address = Some("Ikeja".to_string());
        offer.fare_estimate = Some(3500.0);
        offer.distance_km = Some(12.34);

        assert_eq!(
            describe_offer(&offer),
            "ride 5: Yaba -> Ikeja, fare 3500, 12.3 km"
        );
    }

    #[test]
    fn test_describe_interruption() {
        let notice = SessionNotice::RideInterrupted {
            ride_id: RideId(5),
            status: RideStatus::Cancelled,
            reason: None,
        };
        assert_eq!(describe_notice(&notice), "Ride 5 cancelled by rider");
    }
}
