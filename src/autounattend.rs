// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rendering the Windows answer file from the template in contrib.

use std::{
    borrow::Cow,
    io::{Read, Write},
};

use anyhow::{Context, Result};
use camino::Utf8Path;
use xml::{attribute::Attribute, attribute::OwnedAttribute, reader, writer};

use crate::params::Arch;

// The template is streamed through an XML reader and writer. Text inside
// elements that match one of the rules below is replaced; everything else
// passes through unchanged. A rule is a list of elements that must appear,
// in order, among the ancestors of the text being replaced, the last one
// being its immediate parent. The edition, for example, is the MetaData
// value in the windowsPE pass of the Microsoft-Windows-Setup component:
//
// <unattend>
//   <settings pass="windowsPE">
//     <component name="Microsoft-Windows-Setup">
//       <ImageInstall>
//         <OSImage>
//           <InstallFrom>
//             <MetaData wcm:action="add">
//               <Key>/IMAGE/NAME</Key>
//               <Value>...</Value> <-- replace this
//
// Each <component> also carries a processorArchitecture attribute that has
// to agree with the architecture being installed; those are rewritten as
// they stream past.

/// Windows setup needs this set to `true` before it will install updates.
const UPDATES_DISABLED: &str = "-EnableUpdates:$false";
const UPDATES_ENABLED: &str = "-EnableUpdates:$true";

/// An attribute that must be present on an element for it to match.
struct MatchAttribute {
    name: &'static str,
    value: &'static str,
}

/// A matching rule for one element on the path to the text of interest.
struct MatchElement {
    name: &'static str,
    attributes: Vec<MatchAttribute>,
}

impl MatchElement {
    fn named(name: &'static str) -> Self {
        Self { name, attributes: vec![] }
    }

    fn with(
        name: &'static str,
        attr: &'static str,
        value: &'static str,
    ) -> Self {
        Self { name, attributes: vec![MatchAttribute { name: attr, value }] }
    }

    fn matches(&self, open: &OpenElement) -> bool {
        self.name == open.name
            && self.attributes.iter().all(|attr| {
                open.attributes.iter().any(|a| {
                    a.name.local_name == attr.name && a.value == attr.value
                })
            })
    }
}

enum Action {
    /// Replace the text of the last element on the path.
    Replace(Box<dyn Fn(&str) -> String>),

    /// Drop the last element on the path and everything inside it.
    Remove,
}

struct Rule {
    elements: Vec<MatchElement>,
    action: Action,
}

impl Rule {
    fn replace(
        elements: Vec<MatchElement>,
        f: impl Fn(&str) -> String + 'static,
    ) -> Self {
        Self { elements, action: Action::Replace(Box::new(f)) }
    }

    /// True if this rule's last element matches the innermost open element
    /// and the rest of its elements appear in order further up the stack.
    fn matches(&self, stack: &[OpenElement]) -> bool {
        let Some((last, ancestors)) = self.elements.split_last() else {
            return false;
        };
        let Some((innermost, rest)) = stack.split_last() else {
            return false;
        };
        if !last.matches(innermost) {
            return false;
        }

        let mut open = rest.iter();
        ancestors.iter().all(|want| open.any(|el| want.matches(el)))
    }
}

struct OpenElement {
    name: String,
    attributes: Vec<OwnedAttribute>,
}

/// The values substituted into the answer file template.
#[derive(Clone, Debug)]
pub struct AnswerFileSettings {
    pub arch: Arch,

    /// The name of the image to install from `install.wim`, e.g.
    /// "Windows Server 2012 R2 SERVERSTANDARD".
    pub image_name: String,
    pub language: String,
    pub license_key: Option<String>,
    pub enable_updates: bool,
}

pub struct AutounattendUpdater {
    rules: Vec<Rule>,
    arch: &'static str,
}

fn language_rules(component: &'static str, language: &str) -> Vec<Rule> {
    ["InputLocale", "SystemLocale", "UILanguage", "UserLocale"]
        .into_iter()
        .map(|element| {
            let language = language.to_owned();
            Rule::replace(
                vec![
                    MatchElement::with("component", "name", component),
                    MatchElement::named(element),
                ],
                move |_| language.clone(),
            )
        })
        .collect()
}

impl AutounattendUpdater {
    pub fn new(settings: &AnswerFileSettings) -> Self {
        let mut rules = Vec::new();

        let image_name = settings.image_name.clone();
        rules.push(Rule::replace(
            vec![
                MatchElement::with("settings", "pass", "windowsPE"),
                MatchElement::with(
                    "component",
                    "name",
                    "Microsoft-Windows-Setup",
                ),
                MatchElement::named("InstallFrom"),
                MatchElement::named("MetaData"),
                MatchElement::named("Value"),
            ],
            move |_| image_name.clone(),
        ));

        rules.extend(language_rules(
            "Microsoft-Windows-International-Core-WinPE",
            &settings.language,
        ));
        rules.extend(language_rules(
            "Microsoft-Windows-International-Core",
            &settings.language,
        ));

        let product_key = vec![
            MatchElement::with("component", "name", "Microsoft-Windows-Setup"),
            MatchElement::named("UserData"),
            MatchElement::named("ProductKey"),
        ];
        match settings.license_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => {
                let key = key.to_owned();
                let mut elements = product_key;
                elements.push(MatchElement::named("Key"));
                rules.push(Rule::replace(elements, move |_| key.clone()));
            }
            None => rules
                .push(Rule { elements: product_key, action: Action::Remove }),
        }

        if settings.enable_updates {
            rules.push(Rule::replace(
                vec![
                    MatchElement::named("FirstLogonCommands"),
                    MatchElement::named("SynchronousCommand"),
                    MatchElement::named("CommandLine"),
                ],
                |cmd| cmd.replace(UPDATES_DISABLED, UPDATES_ENABLED),
            ));
        }

        Self { rules, arch: settings.arch.windows_name() }
    }

    /// Renders the template at `template` into `output` with CRLF line
    /// endings. Returns the number of rules that fired.
    pub fn run(&self, template: &Utf8Path, output: &Utf8Path) -> Result<usize> {
        let input = std::fs::read(template).with_context(|| {
            format!("reading answer file template {template}")
        })?;
        let (rendered, matches) = self.render(input.as_slice())?;
        std::fs::write(output, rendered)
            .with_context(|| format!("writing answer file {output}"))?;
        Ok(matches)
    }

    /// Renders `input` and converts the result to CRLF line endings, which
    /// is what Windows setup expects to find on the floppy.
    pub fn render(&self, input: impl Read) -> Result<(String, usize)> {
        let mut buf = Vec::new();
        let matches = self.run_internal(
            xml::EventReader::new(input),
            xml::EventWriter::new(&mut buf),
        )?;

        let text = String::from_utf8(buf).context("answer file isn't UTF-8")?;
        let mut crlf = String::with_capacity(text.len() + text.len() / 16);
        for line in text.lines() {
            crlf.push_str(line);
            crlf.push_str("\r\n");
        }

        Ok((crlf, matches))
    }

    fn run_internal<R: Read, W: Write>(
        &self,
        input: xml::EventReader<R>,
        mut output: xml::EventWriter<W>,
    ) -> Result<usize> {
        let mut matches = 0;
        let mut stack: Vec<OpenElement> = Vec::new();

        // Nonzero while inside an element that is being removed.
        let mut skip_depth = 0usize;

        for e in input {
            let e = e.context("parsing Autounattend.xml template")?;
            match &e {
                reader::XmlEvent::StartElement {
                    name,
                    attributes,
                    namespace,
                } => {
                    if skip_depth > 0 {
                        skip_depth += 1;
                        continue;
                    }

                    stack.push(OpenElement {
                        name: name.local_name.clone(),
                        attributes: attributes.clone(),
                    });

                    if self.rules.iter().any(|rule| {
                        matches!(rule.action, Action::Remove)
                            && rule.matches(&stack)
                    }) {
                        stack.pop();
                        skip_depth = 1;
                        matches += 1;
                        continue;
                    }

                    if name.local_name == "component" {
                        let attributes: Vec<Attribute> = attributes
                            .iter()
                            .map(|a| {
                                if a.name.local_name == "processorArchitecture"
                                {
                                    Attribute::new(a.name.borrow(), self.arch)
                                } else {
                                    a.borrow()
                                }
                            })
                            .collect();

                        output.write(writer::XmlEvent::StartElement {
                            name: name.borrow(),
                            attributes: Cow::Owned(attributes),
                            namespace: Cow::Borrowed(namespace),
                        })?;
                        continue;
                    }
                }
                reader::XmlEvent::EndElement { .. } => {
                    if skip_depth > 0 {
                        skip_depth -= 1;
                        continue;
                    }

                    stack.pop();
                }
                reader::XmlEvent::Characters(data) => {
                    if skip_depth > 0 {
                        continue;
                    }

                    let replacement =
                        self.rules.iter().find_map(|rule| match &rule.action {
                            Action::Replace(f) if rule.matches(&stack) => {
                                Some(f(data))
                            }
                            _ => None,
                        });

                    if let Some(new_data) = replacement {
                        output.write(writer::XmlEvent::Characters(&new_data))?;
                        matches += 1;
                        continue;
                    }
                }
                _ => {
                    if skip_depth > 0 {
                        continue;
                    }
                }
            }

            if let Some(writer_event) = e.as_writer_event() {
                output.write(writer_event)?;
            }
        }

        Ok(matches)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TEMPLATE: &str =
        include_str!("../contrib/windows/Autounattend.xml");

    fn settings() -> AnswerFileSettings {
        AnswerFileSettings {
            arch: Arch::Amd64,
            image_name: "Windows Server 2012 R2 SERVERSTANDARD".to_string(),
            language: "de-DE".to_string(),
            license_key: None,
            enable_updates: false,
        }
    }

    fn render(settings: &AnswerFileSettings) -> (String, usize) {
        AutounattendUpdater::new(settings).render(TEMPLATE.as_bytes()).unwrap()
    }

    #[test]
    fn substitutes_edition_and_language() {
        let (out, matches) = render(&settings());

        assert!(out.contains(
            "<Value>Windows Server 2012 R2 SERVERSTANDARD</Value>"
        ));
        assert!(out.contains("<UILanguage>de-DE</UILanguage>"));
        assert!(out.contains("<SystemLocale>de-DE</SystemLocale>"));
        assert!(!out.contains("en-US"));

        // Image name, five WinPE and four OOBE language settings, and the
        // product key removal.
        assert_eq!(matches, 11);
    }

    #[test]
    fn product_key_is_removed_without_license() {
        let (out, _) = render(&settings());
        assert!(!out.contains("<ProductKey>"));
        assert!(out.contains("<AcceptEula>true</AcceptEula>"));
    }

    #[test]
    fn product_key_is_filled_in_with_license() {
        let (out, matches) = render(&AnswerFileSettings {
            license_key: Some("ABCDE-12345-FGHIJ-67890-KLMNO".to_string()),
            ..settings()
        });

        assert!(out.contains("<Key>ABCDE-12345-FGHIJ-67890-KLMNO</Key>"));
        assert_eq!(matches, 11);
    }

    #[test]
    fn updates_flag_is_enabled_on_request() {
        let (out, _) = render(&settings());
        assert!(out.contains(UPDATES_DISABLED));

        let (out, matches) =
            render(&AnswerFileSettings { enable_updates: true, ..settings() });
        assert!(out.contains(UPDATES_ENABLED));
        assert!(!out.contains(UPDATES_DISABLED));
        assert_eq!(matches, 12);
    }

    #[test]
    fn architecture_is_rewritten_on_every_component() {
        let (out, _) =
            render(&AnswerFileSettings { arch: Arch::I386, ..settings() });

        assert!(out.contains("processorArchitecture=\"x86\""));
        assert!(!out.contains("processorArchitecture=\"amd64\""));
    }

    #[test]
    fn output_uses_crlf_line_endings() {
        let (out, _) = render(&settings());

        assert!(out.ends_with("\r\n"));
        assert_eq!(out.matches('\n').count(), out.matches("\r\n").count());
    }

    #[test]
    fn output_is_still_well_formed() {
        let (out, _) = render(&settings());
        for e in xml::EventReader::new(out.as_bytes()) {
            e.unwrap();
        }
    }
}
