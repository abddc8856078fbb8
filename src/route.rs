use serde::{Deserialize, Serialize};

/// Screens that render content. The assistant overlay is not one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PrimaryRoute {
    #[default]
    Home,
    Lessons,
    Notes,
    Profile,
    ContextBuilder,
}

impl PrimaryRoute {
    pub fn title(self) -> &'static str {
        match self {
            Self::Home => "Armory Dashboard",
            Self::Lessons => "Lessons Library",
            Self::Notes => "Study Notes",
            Self::Profile => "Profile & Settings",
            Self::ContextBuilder => "Context Builder",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Route {
    Home,
    Lessons,
    Notes,
    Profile,
    ContextBuilder,
    AskShield,
}

impl Route {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Home => "home",
            Self::Lessons => "lessons",
            Self::Notes => "notes",
            Self::Profile => "profile",
            Self::ContextBuilder => "context-builder",
            Self::AskShield => "ask-shield",
        }
    }

    pub fn primary(self) -> Option<PrimaryRoute> {
        match self {
            Self::Home => Some(PrimaryRoute::Home),
            Self::Lessons => Some(PrimaryRoute::Lessons),
            Self::Notes => Some(PrimaryRoute::Notes),
            Self::Profile => Some(PrimaryRoute::Profile),
            Self::ContextBuilder => Some(PrimaryRoute::ContextBuilder),
            Self::AskShield => None,
        }
    }
}

impl From<PrimaryRoute> for Route {
    fn from(value: PrimaryRoute) -> Self {
        match value {
            PrimaryRoute::Home => Self::Home,
            PrimaryRoute::Lessons => Self::Lessons,
            PrimaryRoute::Notes => Self::Notes,
            PrimaryRoute::Profile => Self::Profile,
            PrimaryRoute::ContextBuilder => Self::ContextBuilder,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigateData {
    #[serde(default)]
    pub lesson_id: Option<String>,
}

/// Process-local navigation state. Every transition is a plain method; nothing here touches storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteState {
    pub active: Route,
    pub previous: PrimaryRoute,
    pub overlay_open: bool,
    pub selected_lesson_id: Option<String>,
    pub initial_question: Option<String>,
}

impl Default for RouteState {
    fn default() -> Self {
        Self {
            active: Route::Home,
            previous: PrimaryRoute::Home,
            overlay_open: false,
            selected_lesson_id: None,
            initial_question: None,
        }
    }
}

impl RouteState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route whose content is on screen. While the overlay is open this is the remembered route.
    pub fn content_route(&self) -> PrimaryRoute {
        self.active.primary().unwrap_or(self.previous)
    }

    pub fn title(&self) -> &'static str {
        self.content_route().title()
    }

    pub fn navigate(&mut self, route: Route, data: Option<NavigateData>) {
        let Some(primary) = route.primary() else {
            self.open_overlay(None);
            return;
        };

        self.previous = primary;
        self.active = route;
        self.overlay_open = false;
        self.initial_question = None;
        self.selected_lesson_id = match primary {
            PrimaryRoute::Lessons => data.and_then(|data| data.lesson_id),
            _ => None,
        };
    }

    pub fn open_overlay(&mut self, question: Option<String>) {
        // Re-opening must not remember the overlay itself.
        if self.active != Route::AskShield {
            self.previous = self.content_route();
        }
        self.initial_question = question;
        self.overlay_open = true;
        self.active = Route::AskShield;
    }

    pub fn close_overlay(&mut self) {
        self.overlay_open = false;
        self.active = self.previous.into();
        self.initial_question = None;
    }

    pub fn select_lesson(&mut self, lesson_id: &str) {
        self.selected_lesson_id = Some(lesson_id.to_string());
    }

    pub fn clear_lesson(&mut self) {
        self.selected_lesson_id = None;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
