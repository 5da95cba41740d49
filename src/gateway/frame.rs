use axum::response::sse::Event;

/// 运行时产出的 SSE 帧；由路由层转成 axum Event 写出。
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `data: <payload>`
    Data(String),
    /// `event: <name>\ndata: <payload>`
    Named { event: String, data: String },
    /// `: <comment>`（keep-alive）
    Comment(&'static str),
}

impl Frame {
    pub fn named(event: &str, data: String) -> Self {
        Self::Named {
            event: event.to_string(),
            data,
        }
    }

    pub fn into_event(self) -> Event {
        match self {
            Frame::Data(data) => Event::default().data(data),
            Frame::Named { event, data } => Event::default().event(event).data(data),
            Frame::Comment(c) => Event::default().comment(c),
        }
    }

    pub fn data_str(&self) -> Option<&str> {
        match self {
            Frame::Data(d) => Some(d),
            Frame::Named { data, .. } => Some(data),
            Frame::Comment(_) => None,
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        match self {
            Frame::Named { event, .. } => Some(event),
            _ => None,
        }
    }
}
