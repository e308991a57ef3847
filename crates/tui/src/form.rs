//! Create/edit form for a tunnel

use tunnel9_common::{parse_tags, TunnelId, TunnelSpec};

/// Editable fields, in tab order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Name,
    BindAddress,
    LocalPort,
    RemoteHost,
    RemotePort,
    SshHost,
    SshPort,
    SshUser,
    KeyPath,
    Tags,
}

impl Field {
    pub const ALL: [Field; 10] = [
        Field::Name,
        Field::BindAddress,
        Field::LocalPort,
        Field::RemoteHost,
        Field::RemotePort,
        Field::SshHost,
        Field::SshPort,
        Field::SshUser,
        Field::KeyPath,
        Field::Tags,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Field::Name => "Name",
            Field::BindAddress => "Bind address",
            Field::LocalPort => "Local port",
            Field::RemoteHost => "Remote host",
            Field::RemotePort => "Remote port",
            Field::SshHost => "SSH host",
            Field::SshPort => "SSH port",
            Field::SshUser => "SSH user",
            Field::KeyPath => "Key path",
            Field::Tags => "Tags",
        }
    }

    fn index(self) -> usize {
        Field::ALL.iter().position(|f| *f == self).unwrap_or(0)
    }
}

/// In-progress edit of a tunnel spec
#[derive(Debug, Clone, PartialEq)]
pub struct EditForm {
    /// Spec being edited; None when creating
    original: Option<TunnelSpec>,
    values: Vec<String>,
    focus: usize,
    /// Validation error from the last save attempt
    pub error: Option<String>,
}

impl EditForm {
    /// Blank form with the usual defaults filled in
    pub fn new_tunnel() -> Self {
        let mut form = Self {
            original: None,
            values: vec![String::new(); Field::ALL.len()],
            focus: 0,
            error: None,
        };
        form.set(Field::BindAddress, "127.0.0.1");
        form.set(Field::RemoteHost, "localhost");
        form.set(Field::SshPort, "22");
        form
    }

    pub fn from_spec(spec: &TunnelSpec) -> Self {
        let mut form = Self {
            original: Some(spec.clone()),
            values: vec![String::new(); Field::ALL.len()],
            focus: 0,
            error: None,
        };
        form.set(Field::Name, &spec.name);
        form.set(Field::BindAddress, &spec.bind_address);
        form.set(Field::LocalPort, &spec.local_port.to_string());
        form.set(Field::RemoteHost, &spec.remote_host);
        form.set(Field::RemotePort, &spec.remote_port.to_string());
        form.set(Field::SshHost, &spec.ssh.host);
        form.set(Field::SshPort, &spec.ssh.port.to_string());
        form.set(Field::SshUser, spec.ssh.user.as_deref().unwrap_or(""));
        form.set(Field::KeyPath, spec.ssh.key_path.as_deref().unwrap_or(""));
        let tags: Vec<&str> = spec.tags.iter().map(String::as_str).collect();
        form.set(Field::Tags, &tags.join(", "));
        form
    }

    /// Id of the tunnel being edited
    pub fn editing(&self) -> Option<&TunnelId> {
        self.original.as_ref().map(|spec| &spec.id)
    }

    pub fn title(&self) -> &'static str {
        if self.original.is_some() {
            "Edit tunnel"
        } else {
            "New tunnel"
        }
    }

    pub fn value(&self, field: Field) -> &str {
        &self.values[field.index()]
    }

    fn set(&mut self, field: Field, value: &str) {
        self.values[field.index()] = value.to_string();
    }

    pub fn focused(&self) -> Field {
        Field::ALL[self.focus]
    }

    pub fn next_field(&mut self) {
        self.focus = (self.focus + 1) % Field::ALL.len();
    }

    pub fn prev_field(&mut self) {
        self.focus = (self.focus + Field::ALL.len() - 1) % Field::ALL.len();
    }

    pub fn insert(&mut self, c: char) {
        self.values[self.focus].push(c);
        self.error = None;
    }

    pub fn backspace(&mut self) {
        self.values[self.focus].pop();
        self.error = None;
    }

    /// Build the spec described by the form
    ///
    /// `others` are the remaining tunnels, used to reject a second tunnel on the
    /// same local endpoint.
    pub fn build(&self, others: &[TunnelSpec]) -> Result<TunnelSpec, String> {
        let text = |field: Field| self.value(field).trim().to_string();
        let optional = |field: Field| Some(text(field)).filter(|v| !v.is_empty());

        let name = text(Field::Name);
        if name.is_empty() {
            return Err("Name cannot be empty".to_string());
        }

        let mut spec = match &self.original {
            Some(original) => original.clone(),
            None => {
                let mut spec = TunnelSpec::new(name.clone(), 0, "", 0, "");
                spec.id = TunnelId::generate();
                spec
            }
        };

        spec.name = name;
        spec.bind_address = text(Field::BindAddress);
        spec.local_port = parse_port(Field::LocalPort, &text(Field::LocalPort))?;
        spec.remote_host = text(Field::RemoteHost);
        spec.remote_port = parse_port(Field::RemotePort, &text(Field::RemotePort))?;
        spec.ssh.host = text(Field::SshHost);
        spec.ssh.port = parse_port(Field::SshPort, &text(Field::SshPort))?;
        spec.ssh.user = optional(Field::SshUser);
        spec.ssh.key_path = optional(Field::KeyPath);
        spec.tags = parse_tags(self.value(Field::Tags)).into_iter().collect();

        spec.validate().map_err(|e| e.to_string())?;

        if let Some(clash) = others.iter().find(|other| {
            other.id != spec.id
                && other.local_port == spec.local_port
                && other.bind_address == spec.bind_address
        }) {
            return Err(format!(
                "{} is already used by {}",
                spec.local_endpoint(),
                clash.name
            ));
        }

        Ok(spec)
    }
}

fn parse_port(field: Field, value: &str) -> Result<u16, String> {
    match value.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(format!("{} must be a number between 1 and 65535", field.label())),
    }
}
